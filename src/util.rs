use tracing::level_filters::LevelFilter;

const PIPELINE_CONFIG: &str = "PIPELINE_CONFIG";

pub fn get_config_path() -> Option<String> {
    let path_from_env = std::env::var(PIPELINE_CONFIG);
    path_from_env.ok().filter(|path| !path.is_empty())
}

const PIPELINE_LOG: &str = "PIPELINE_LOG";

const DEFAULT_LOG_LEVEL: LevelFilter = LevelFilter::INFO;

pub fn get_log_level() -> LevelFilter {
    let level_from_env = std::env::var(PIPELINE_LOG);
    level_from_env.map_or(DEFAULT_LOG_LEVEL, |res| parse_log_level(&res))
}

/// Parse a level name such as `debug`, falling back to `info`
pub fn parse_log_level(level: &str) -> LevelFilter {
    level.trim().parse().unwrap_or(DEFAULT_LOG_LEVEL)
}
