use std::{env, num::NonZeroUsize, str::FromStr, time::Duration};

use crate::{
    error::{EstimatorErr, Result},
    predictor::PredictorConfig,
};

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_millis(1000);

/// The client's runtime configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// The estimator's `host:port`.
    pub addr: String,
    pub predictor: PredictorConfig,
    /// How long a lot may wait for its results, forever if `None`.
    pub lot_timeout: Option<Duration>,
    pub sweep_interval: Duration,
}

impl ClientConfig {
    /// Reads the configuration from the process environment.
    ///
    /// `ESTIMATOR_PORT` is required. `ESTIMATOR_HOST`, `DEPTH`, `PROB`,
    /// `LOT_TIMEOUT_MS` and `SWEEP_INTERVAL_MS` are optional.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the configuration from an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let host = lookup("ESTIMATOR_HOST").unwrap_or_else(|| DEFAULT_HOST.to_string());
        let port: u16 = parse(&lookup, "ESTIMATOR_PORT")?
            .ok_or_else(|| EstimatorErr::InvalidConfig("ESTIMATOR_PORT is not set".into()))?;

        let mut predictor = PredictorConfig::default();
        if let Some(depth) = parse::<usize, _>(&lookup, "DEPTH")? {
            predictor.depth = NonZeroUsize::new(depth)
                .ok_or_else(|| EstimatorErr::InvalidConfig("DEPTH must be at least 1".into()))?;
        }
        if let Some(prob) = lookup("PROB") {
            predictor.probabilistic = parse_flag(&prob)?;
        }

        let lot_timeout = parse(&lookup, "LOT_TIMEOUT_MS")?.map(Duration::from_millis);
        let sweep_interval = match parse(&lookup, "SWEEP_INTERVAL_MS")? {
            Some(0) => {
                return Err(EstimatorErr::InvalidConfig(
                    "SWEEP_INTERVAL_MS must be positive".into(),
                ))
            }
            Some(ms) => Duration::from_millis(ms),
            None => DEFAULT_SWEEP_INTERVAL,
        };

        Ok(Self {
            addr: format!("{host}:{port}"),
            predictor,
            lot_timeout,
            sweep_interval,
        })
    }
}

fn parse<V, F>(lookup: &F, key: &str) -> Result<Option<V>>
where
    V: FromStr,
    V::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .map(|raw| {
            raw.trim()
                .parse()
                .map_err(|e| EstimatorErr::InvalidConfig(format!("{key}={raw}: {e}")))
        })
        .transpose()
}

fn parse_flag(raw: &str) -> Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" => Ok(true),
        "" | "0" | "false" | "no" => Ok(false),
        other => Err(EstimatorErr::InvalidConfig(format!(
            "PROB={other} is not a boolean"
        ))),
    }
}
