use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use std::path::Path;

use crate::config::AppConfig;
use crate::errors::LoopResult;

pub const DEFAULT_CONFIG_FILE: &str = "sentiment_loop.toml";
pub const CONFIG_PATH_ENV: &str = "SENTIMENT_LOOP_CONFIG";

/// Build the layered figment: defaults, then the TOML file, then `LOOP_` env vars.
///
/// Nested keys use a double underscore, e.g. `LOOP_CONTROL__DRIFT_THRESHOLD=0.3`.
pub fn figment(path: Option<&Path>) -> Figment {
    let file = path
        .map(|p| p.to_path_buf())
        .or_else(|| std::env::var(CONFIG_PATH_ENV).ok().map(Into::into))
        .unwrap_or_else(|| DEFAULT_CONFIG_FILE.into());

    Figment::from(Serialized::defaults(AppConfig::default()))
        .merge(Toml::file(file))
        .merge(Env::prefixed("LOOP_").split("__"))
}

pub fn load_config(path: Option<&Path>) -> LoopResult<AppConfig> {
    let config: AppConfig = figment(path).extract()?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn toml_and_env_layers_override_defaults() {
        figment::Jail::expect_with(|jail| {
            jail.create_file(
                "loop.toml",
                r#"
                    data_dir = "/tmp/feedback"

                    [control]
                    drift_threshold = 0.35
                    min_sample_count = 50
                "#,
            )?;
            jail.set_env("LOOP_CONTROL__COOLDOWN_PERIOD_SECS", "120");

            let cfg = load_config(Some(Path::new("loop.toml"))).map_err(|e| e.to_string())?;
            assert_eq!(cfg.data_dir, "/tmp/feedback");
            assert_eq!(cfg.control.drift_threshold, 0.35);
            assert_eq!(cfg.control.min_sample_count, 50);
            assert_eq!(cfg.control.cooldown_period_secs, 120);
            assert_eq!(cfg.control.accuracy_floor, 0.7);
            Ok(())
        });
    }

    #[test]
    fn drift_method_is_selected_by_name() {
        figment::Jail::expect_with(|jail| {
            jail.create_file(
                "loop.toml",
                r#"
                    [control]
                    drift_method = "kl"
                "#,
            )?;
            let cfg = load_config(Some(Path::new("loop.toml"))).map_err(|e| e.to_string())?;
            assert_eq!(cfg.control.drift_method, crate::drift::DriftMethod::Kl);
            assert_eq!(cfg.control.drift_method.statistic().name(), "kl");

            jail.set_env("LOOP_CONTROL__DRIFT_METHOD", "chi2");
            assert!(load_config(Some(Path::new("loop.toml"))).is_err());
            Ok(())
        });
    }

    #[test]
    fn invalid_values_fail_fast() {
        figment::Jail::expect_with(|jail| {
            jail.set_env("LOOP_CONTROL__TRAIN_TEST_SPLIT_RATIO", "1.5");
            let result = load_config(Some(Path::new("missing.toml")));
            assert!(result.is_err());
            Ok(())
        });
    }
}
