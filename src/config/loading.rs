use std::path::Path;

use config::{builder::DefaultState, Config, ConfigBuilder, ConfigError, Environment, File};

use super::models::Settings;

/// Loads settings from defaults, an optional config file and `PRINTSYNC_*` env vars.
pub fn load_config(config_file: Option<&Path>) -> Result<Settings, ConfigError> {
    // As Rust has no native support for .env files,
    // we use the dotenv_flow crate to import to actual ENV vars.
    if let Ok(dotenv_path) = dotenv_flow::dotenv_flow() {
        println!("Loaded dotenv file: {:?}", dotenv_path);
    }

    build_config(config_file, true)
}

pub(crate) fn build_config(config_file: Option<&Path>, with_env: bool) -> Result<Settings, ConfigError> {
    let mut builder = with_defaults(Config::builder())?;

    builder = match config_file {
        Some(path) => builder.add_source(File::from(path).required(true)),
        None => builder.add_source(File::with_name("printersync").required(false)),
    };

    if with_env {
        builder = builder.add_source(Environment::default()
            .prefix("PRINTSYNC")
            .separator("_")
            .prefix_separator("_")
            .try_parsing(true));
    }

    builder.build()?.try_deserialize()
}

fn with_defaults(builder: ConfigBuilder<DefaultState>) -> Result<ConfigBuilder<DefaultState>, ConfigError> {
    builder
        .set_default("firebase.credentialsfile", "serviceAccountKey.json")?
        .set_default("firebase.projectid", "")?
        .set_default("firebase.database", "(default)")?
        .set_default("firebase.apibase", "https://firestore.googleapis.com/v1/")?
        .set_default("firebase.emulator", "false")?
        .set_default("firebase.accountcollection", "accounts")?
        .set_default("firebase.jobscollection", "print_jobs")?
        .set_default("firebase.printerscollection", "printers")?
        .set_default("firebase.publishprinters", "true")?
        .set_default("firebase.token", "")?
        .set_default("firebase.batchsize", "20")?
        .set_default("firebase.timeout", "30s")?
        .set_default("cups.uri", "http://localhost:631/")?
        .set_default("cups.ignoretlserrors", "true")?
        .set_default("cups.username", "")?
        .set_default("cups.password", "")?
        .set_default("cups.defaultprinter", "")?
        .set_default("cups.requestinguser", "printersync")?
        .set_default("polling.schedule", "5s")?
        .set_default("polling.failurewait", "30s")?
        .set_default("documents.maxbytes", "52428800")?
        .set_default("documents.timeout", "60s")?
        .set_default("log.file", "printersync.log")?
        .set_default("log.level", "info")?
        .set_default("sentrydsn", "")
}
