//! `toolstream config` — Print the effective configuration.

use toolstream_config::OrchestratorConfig;

pub fn show(config: &OrchestratorConfig) -> Result<(), Box<dyn std::error::Error>> {
    let toml_str = toml::to_string_pretty(config)?;
    println!("# {}", OrchestratorConfig::config_dir().join("config.toml").display());
    println!("{toml_str}");
    Ok(())
}
