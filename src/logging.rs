use std::fmt;

use serde::de::{self, Deserializer, Visitor};
use tracing_subscriber::{filter::EnvFilter, FmtSubscriber};

#[derive(Debug, Deserialize)]
pub struct LoggingSettings {
    #[serde(default = "default_env_filter")]
    #[serde(deserialize_with = "deserialize_env_filter")]
    pub filter: EnvFilter,
}

fn default_env_filter() -> EnvFilter {
    EnvFilter::new("info")
}

fn deserialize_env_filter<'de, D>(deserializer: D) -> Result<EnvFilter, D::Error>
where
    D: Deserializer<'de>,
{
    struct EnvFilterVisitor;

    impl<'de> Visitor<'de> for EnvFilterVisitor {
        type Value = EnvFilter;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("a valid tracing filter directive")
        }

        fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            EnvFilter::try_new(value).map_err(E::custom)
        }
    }

    deserializer.deserialize_str(EnvFilterVisitor)
}

pub fn configure(settings: LoggingSettings) {
    let fmt_subscriber = FmtSubscriber::builder()
        .with_ansi(true)
        .with_env_filter(settings.filter)
        .finish();
    tracing::subscriber::set_global_default(fmt_subscriber).expect("failed to setup tracing");
}
