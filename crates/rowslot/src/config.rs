//! Table and connection options.
//!
//! Options arrive as a flat string map (the shape a host query engine hands
//! to a data source) or as `ROWSLOT_*` environment variables. Parsing is
//! strict: an unparsable value is a configuration error naming the option.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Result, RowSlotError};
use crate::schema::SchemaRef;

pub const OPT_TABLE: &str = "table";
pub const OPT_KEYS_PATTERN: &str = "keys.pattern";
pub const OPT_KEY_COLUMN: &str = "key.column";
pub const OPT_PARTITIONS: &str = "partitions.number";
pub const OPT_INFER_SCHEMA: &str = "infer.schema";
pub const OPT_MODEL: &str = "model";
pub const OPT_TTL: &str = "ttl";
pub const OPT_SCAN_COUNT: &str = "scan.count";
pub const OPT_MAX_PIPELINE: &str = "max.pipeline.size";
pub const OPT_HOST: &str = "host";
pub const OPT_PORT: &str = "port";
pub const OPT_AUTH: &str = "auth";
pub const OPT_DB_NUM: &str = "dbNum";
pub const OPT_TIMEOUT: &str = "timeout";

/// Every option name [`TableOptions::from_options`] understands.
pub const ALL_OPTIONS: &[&str] = &[
    OPT_TABLE,
    OPT_KEYS_PATTERN,
    OPT_KEY_COLUMN,
    OPT_PARTITIONS,
    OPT_INFER_SCHEMA,
    OPT_MODEL,
    OPT_TTL,
    OPT_SCAN_COUNT,
    OPT_MAX_PIPELINE,
    OPT_HOST,
    OPT_PORT,
    OPT_AUTH,
    OPT_DB_NUM,
    OPT_TIMEOUT,
];

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 6379;
pub const DEFAULT_TIMEOUT_MS: u64 = 2000;
pub const DEFAULT_PARTITIONS: usize = 3;
pub const DEFAULT_SCAN_COUNT: usize = 100;
pub const DEFAULT_MAX_PIPELINE: usize = 100;

/// On-the-wire row representation, fixed per table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum EncodingModel {
    /// One hash per row, one hash field per non-null column.
    #[default]
    Hash,
    /// One string value per row holding the whole serialized row.
    Binary,
}

impl FromStr for EncodingModel {
    type Err = RowSlotError;

    fn from_str(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "hash" => Ok(Self::Hash),
            "binary" => Ok(Self::Binary),
            other => Err(RowSlotError::config(format!(
                "unsupported {OPT_MODEL} '{other}', expected 'hash' or 'binary'"
            ))),
        }
    }
}

impl fmt::Display for EncodingModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Hash => f.write_str("hash"),
            Self::Binary => f.write_str("binary"),
        }
    }
}

/// Store connection parameters, applied uniformly to every node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    /// Seed host used for topology discovery.
    pub host: String,
    pub port: u16,
    pub auth: Option<String>,
    pub db_num: u32,
    /// Bound on connect and on each pipeline round-trip.
    pub timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            auth: None,
            db_num: 0,
            timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
        }
    }
}

impl ConnectionConfig {
    /// Seed address as `host:port`.
    pub fn seed_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Everything one relation engine needs to know about its table.
#[derive(Debug, Clone)]
pub struct TableOptions {
    table: Option<String>,
    keys_pattern: Option<String>,
    pub key_column: Option<String>,
    pub partitions: usize,
    pub infer_schema: bool,
    pub model: EncodingModel,
    /// Seconds; `0` disables expiry.
    pub ttl: u64,
    pub scan_count: usize,
    pub max_pipeline: usize,
    pub connection: ConnectionConfig,
    /// Schema declared by the caller, which wins over persisted and inferred ones.
    pub user_schema: Option<SchemaRef>,
}

impl TableOptions {
    /// Options for a named table with every other setting at its default.
    pub fn for_table(table: impl Into<String>) -> Self {
        Self {
            table: Some(table.into()),
            ..Self::unnamed()
        }
    }

    /// Options for an arbitrary key glob, without a table name.
    pub fn for_pattern(pattern: impl Into<String>) -> Self {
        Self {
            keys_pattern: Some(pattern.into()),
            ..Self::unnamed()
        }
    }

    fn unnamed() -> Self {
        Self {
            table: None,
            keys_pattern: None,
            key_column: None,
            partitions: DEFAULT_PARTITIONS,
            infer_schema: false,
            model: EncodingModel::Hash,
            ttl: 0,
            scan_count: DEFAULT_SCAN_COUNT,
            max_pipeline: DEFAULT_MAX_PIPELINE,
            connection: ConnectionConfig::default(),
            user_schema: None,
        }
    }

    /// Parses the recognized option names out of `options`.
    ///
    /// Unknown option names are ignored so callers can pass through a host
    /// engine's full option bag.
    pub fn from_options(options: &BTreeMap<String, String>) -> Result<Self> {
        let get = |name: &str| {
            options
                .get(name)
                .map(|value| value.trim())
                .filter(|value| !value.is_empty())
                .map(str::to_string)
        };

        let mut opts = Self::unnamed();
        opts.table = get(OPT_TABLE);
        opts.keys_pattern = get(OPT_KEYS_PATTERN);
        opts.key_column = get(OPT_KEY_COLUMN);
        opts.partitions = parse_opt(OPT_PARTITIONS, get(OPT_PARTITIONS), DEFAULT_PARTITIONS)?.max(1);
        opts.infer_schema = parse_opt(OPT_INFER_SCHEMA, get(OPT_INFER_SCHEMA), false)?;
        opts.model = get(OPT_MODEL)
            .map(|raw| raw.parse::<EncodingModel>())
            .transpose()?
            .unwrap_or_default();
        opts.ttl = parse_opt(OPT_TTL, get(OPT_TTL), 0)?;
        opts.scan_count = parse_opt(OPT_SCAN_COUNT, get(OPT_SCAN_COUNT), DEFAULT_SCAN_COUNT)?.max(1);
        opts.max_pipeline =
            parse_opt(OPT_MAX_PIPELINE, get(OPT_MAX_PIPELINE), DEFAULT_MAX_PIPELINE)?.max(1);
        opts.connection = ConnectionConfig {
            host: get(OPT_HOST).unwrap_or_else(|| DEFAULT_HOST.to_string()),
            port: parse_opt(OPT_PORT, get(OPT_PORT), DEFAULT_PORT)?,
            auth: get(OPT_AUTH),
            db_num: parse_opt(OPT_DB_NUM, get(OPT_DB_NUM), 0)?,
            timeout: Duration::from_millis(parse_opt(
                OPT_TIMEOUT,
                get(OPT_TIMEOUT),
                DEFAULT_TIMEOUT_MS,
            )?),
        };
        opts.validate()?;
        Ok(opts)
    }

    /// Reads options from `ROWSLOT_<NAME>` variables, e.g. `ROWSLOT_KEYS_PATTERN`
    /// for `keys.pattern` and `ROWSLOT_DBNUM` for `dbNum`.
    pub fn from_env() -> Result<Self> {
        Self::from_options(&env_options())
    }

    /// Rejects configuring both a table name and a key pattern.
    pub fn validate(&self) -> Result<()> {
        if self.table.is_some() && self.keys_pattern.is_some() {
            return Err(RowSlotError::config(format!(
                "both '{OPT_TABLE}' and '{OPT_KEYS_PATTERN}' are set; configure exactly one"
            )));
        }
        Ok(())
    }

    pub fn with_key_column(mut self, column: impl Into<String>) -> Self {
        self.key_column = Some(column.into());
        self
    }

    pub fn with_model(mut self, model: EncodingModel) -> Self {
        self.model = model;
        self
    }

    pub fn with_ttl(mut self, ttl: u64) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_infer_schema(mut self, infer: bool) -> Self {
        self.infer_schema = infer;
        self
    }

    pub fn with_partitions(mut self, partitions: usize) -> Self {
        self.partitions = partitions.max(1);
        self
    }

    pub fn with_scan_count(mut self, count: usize) -> Self {
        self.scan_count = count.max(1);
        self
    }

    pub fn with_max_pipeline(mut self, max: usize) -> Self {
        self.max_pipeline = max.max(1);
        self
    }

    pub fn with_connection(mut self, connection: ConnectionConfig) -> Self {
        self.connection = connection;
        self
    }

    pub fn with_schema(mut self, schema: SchemaRef) -> Self {
        self.user_schema = Some(schema);
        self
    }

    /// Table name, required for writes and for the persisted schema.
    pub fn table_name(&self) -> Result<&str> {
        self.table.as_deref().ok_or_else(|| {
            RowSlotError::config(format!("option '{OPT_TABLE}' is not set"))
        })
    }

    /// Glob enumerating the table's keys: the explicit pattern, or `<table>:*`.
    pub fn keys_pattern(&self) -> Result<String> {
        match (&self.keys_pattern, &self.table) {
            (Some(pattern), _) => Ok(pattern.clone()),
            (None, Some(table)) => Ok(crate::keys::table_pattern(table)),
            (None, None) => Err(RowSlotError::config(format!(
                "neither '{OPT_TABLE}' nor '{OPT_KEYS_PATTERN}' is set"
            ))),
        }
    }
}

/// Option map built from whichever `ROWSLOT_*` variables are set.
pub fn env_options() -> BTreeMap<String, String> {
    ALL_OPTIONS
        .iter()
        .filter_map(|name| {
            std::env::var(env_var_name(name))
                .ok()
                .map(|value| ((*name).to_string(), value))
        })
        .collect()
}

/// `keys.pattern` becomes `ROWSLOT_KEYS_PATTERN`.
pub fn env_var_name(option: &str) -> String {
    format!("ROWSLOT_{}", option.replace('.', "_").to_ascii_uppercase())
}

fn parse_opt<T: FromStr>(name: &str, raw: Option<String>, default: T) -> Result<T> {
    match raw {
        None => Ok(default),
        Some(raw) => raw
            .parse::<T>()
            .map_err(|_| RowSlotError::config(format!("invalid value '{raw}' for option '{name}'"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn defaults_apply_when_options_are_absent() {
        let opts = TableOptions::from_options(&options(&[("table", "person")]))
            .expect("options should parse");
        assert_eq!(opts.table_name().expect("table"), "person");
        assert_eq!(opts.keys_pattern().expect("pattern"), "person:*");
        assert_eq!(opts.model, EncodingModel::Hash);
        assert_eq!(opts.partitions, DEFAULT_PARTITIONS);
        assert_eq!(opts.ttl, 0);
        assert!(!opts.infer_schema);
        assert_eq!(opts.connection, ConnectionConfig::default());
    }

    #[test]
    fn parses_every_recognized_option() {
        let opts = TableOptions::from_options(&options(&[
            ("keys.pattern", "user:*"),
            ("key.column", "id"),
            ("partitions.number", "8"),
            ("infer.schema", "true"),
            ("model", "Binary"),
            ("ttl", "60"),
            ("scan.count", "500"),
            ("max.pipeline.size", "10"),
            ("host", "10.0.0.5"),
            ("port", "7000"),
            ("auth", "secret"),
            ("dbNum", "2"),
            ("timeout", "150"),
        ]))
        .expect("options should parse");
        assert_eq!(opts.keys_pattern().expect("pattern"), "user:*");
        assert!(opts.table_name().is_err());
        assert_eq!(opts.key_column.as_deref(), Some("id"));
        assert_eq!(opts.partitions, 8);
        assert!(opts.infer_schema);
        assert_eq!(opts.model, EncodingModel::Binary);
        assert_eq!(opts.ttl, 60);
        assert_eq!(opts.scan_count, 500);
        assert_eq!(opts.max_pipeline, 10);
        assert_eq!(opts.connection.seed_addr(), "10.0.0.5:7000");
        assert_eq!(opts.connection.auth.as_deref(), Some("secret"));
        assert_eq!(opts.connection.db_num, 2);
        assert_eq!(opts.connection.timeout, Duration::from_millis(150));
    }

    #[test]
    fn table_and_pattern_together_are_rejected() {
        let err = TableOptions::from_options(&options(&[("table", "t"), ("keys.pattern", "t:*")]))
            .expect_err("both identities should fail");
        assert!(matches!(err, RowSlotError::Configuration(_)));
    }

    #[test]
    fn missing_identity_fails_only_when_needed() {
        let opts = TableOptions::from_options(&BTreeMap::new()).expect("empty options parse");
        assert!(matches!(
            opts.keys_pattern(),
            Err(RowSlotError::Configuration(_))
        ));
        assert!(matches!(
            opts.table_name(),
            Err(RowSlotError::Configuration(_))
        ));
    }

    #[test]
    fn invalid_values_name_the_option() {
        let err = TableOptions::from_options(&options(&[("table", "t"), ("ttl", "-1")]))
            .expect_err("negative ttl should fail");
        assert!(err.to_string().contains("'ttl'"));

        let err = TableOptions::from_options(&options(&[("table", "t"), ("model", "json")]))
            .expect_err("unknown model should fail");
        assert!(err.to_string().contains("json"));
    }

    #[test]
    fn env_names_are_upper_snake() {
        assert_eq!(env_var_name("keys.pattern"), "ROWSLOT_KEYS_PATTERN");
        assert_eq!(env_var_name("dbNum"), "ROWSLOT_DBNUM");
    }
}
