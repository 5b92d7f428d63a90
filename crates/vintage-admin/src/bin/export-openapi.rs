//! Prints the admin API description, or writes it to the given path.
//! A path ending in `.json` gets JSON; anything else gets YAML.

use std::{env, fs, path::Path};

use anyhow::{Context, Result};
use utoipa::OpenApi;
use vintage_admin::server::docs::ApiDoc;

fn main() -> Result<()> {
    let openapi = ApiDoc::openapi();

    let Some(output) = env::args().nth(1) else {
        println!(
            "{}",
            openapi.to_yaml().context("failed to serialise OpenAPI")?
        );
        return Ok(());
    };

    let path = Path::new(&output);
    let rendered = if path.extension().is_some_and(|ext| ext == "json") {
        openapi
            .to_pretty_json()
            .context("failed to serialise OpenAPI")?
    } else {
        openapi.to_yaml().context("failed to serialise OpenAPI")?
    };

    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create directory for {}", path.display()))?;
    }
    fs::write(path, rendered).with_context(|| format!("failed to write {}", path.display()))?;
    eprintln!("wrote {}", path.display());
    Ok(())
}
