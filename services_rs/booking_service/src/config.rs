use regex::Regex;
use rental_common::secret_policy::{self, EnvKind};
use std::env;
use std::str::FromStr;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StoreBackend {
    Postgres,
    Memory,
}

#[derive(Clone, Debug)]
pub struct Config {
    pub env_name: String,
    pub env_kind: EnvKind,

    pub host: String,
    pub port: u16,
    pub max_body_bytes: usize,

    pub store: StoreBackend,
    pub db_url: String,
    pub db_schema: Option<String>,

    pub require_internal_secret: bool,
    pub internal_secret: Option<String>,
    pub internal_allowed_callers: Vec<String>,
    pub allowed_origins: Vec<String>,

    pub fee_bps: i64,
    pub currency: String,
    pub pending_timeout_secs: i64,
    pub cancel_cutoff_hours: i64,
    pub max_rental_days: i64,

    pub gateway_base_url: String,
    pub gateway_key_id: String,
    pub gateway_key_secret: String,
    pub gateway_webhook_secret: String,
    pub gateway_timeout_secs: u64,
    pub gateway_max_attempts: u32,
    pub gateway_backoff_ms: u64,

    pub refund_poll_interval_secs: u64,
    pub housekeeping_interval_secs: u64,
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_opt(key: &str) -> Option<String> {
    match env::var(key) {
        Ok(v) => {
            let v = v.trim().to_string();
            if v.is_empty() {
                None
            } else {
                Some(v)
            }
        }
        Err(_) => None,
    }
}

fn env_parse<T: FromStr>(key: &str, default: T) -> Result<T, String> {
    match env_opt(key) {
        Some(raw) => raw
            .parse()
            .map_err(|_| format!("{key} must be a valid number")),
        None => Ok(default),
    }
}

fn parse_csv(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect()
}

fn normalize_db_url(raw: &str) -> String {
    // "postgresql+asyncpg://..." -> "postgresql://..."
    if let Some(colon) = raw.find(':') {
        let (scheme, rest) = raw.split_at(colon);
        if let Some(plus) = scheme.find('+') {
            return format!("{}{}", &scheme[..plus], rest);
        }
    }
    raw.to_string()
}

fn validate_postgres_url(url: &str) -> Result<(), String> {
    let scheme = url
        .split_once(':')
        .map(|(s, _)| s.trim().to_lowercase())
        .unwrap_or_default();
    match scheme.as_str() {
        "postgres" | "postgresql" => Ok(()),
        _ => Err("BOOKING_DB_URL (or DB_URL) must be a postgres URL".to_string()),
    }
}

fn parse_required_bool_like(raw: &str) -> Option<bool> {
    let v = raw.trim().to_lowercase();
    if v.is_empty() {
        return None;
    }
    if matches!(v.as_str(), "0" | "false" | "no" | "off") {
        Some(false)
    } else {
        Some(true)
    }
}

impl Config {
    pub fn from_env() -> Result<Self, String> {
        let env_name = env_or("ENV", "dev");
        let env_kind = EnvKind::parse(&env_name);
        let prod_like = env_kind.is_production_like();

        let host = env_or("APP_HOST", "0.0.0.0");
        let port: u16 = env_or("APP_PORT", "8085")
            .parse()
            .map_err(|_| "APP_PORT must be a valid u16".to_string())?;
        let max_body_bytes: usize = env_or("BOOKING_MAX_BODY_BYTES", "65536")
            .parse()
            .map_err(|_| "BOOKING_MAX_BODY_BYTES must be an integer".to_string())?;
        let max_body_bytes = max_body_bytes.clamp(4 * 1024, 1024 * 1024);

        let store = match env_or("BOOKING_STORE", "postgres")
            .trim()
            .to_ascii_lowercase()
            .as_str()
        {
            "postgres" | "postgresql" => StoreBackend::Postgres,
            "memory" => StoreBackend::Memory,
            _ => return Err("BOOKING_STORE must be postgres or memory".to_string()),
        };
        if store == StoreBackend::Memory && !env_kind.is_local() {
            return Err("BOOKING_STORE=memory is only allowed in dev/test".to_string());
        }

        let db_raw = env_opt("BOOKING_DB_URL")
            .or_else(|| env_opt("DB_URL"))
            .unwrap_or_else(|| "postgresql://rental:rental@db:5432/rental_booking".to_string());
        let db_url = normalize_db_url(&db_raw);
        validate_postgres_url(&db_url)?;

        let db_schema = env_opt("DB_SCHEMA");
        if let Some(s) = &db_schema {
            let re = Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").map_err(|e| e.to_string())?;
            if !re.is_match(s) {
                return Err("DB_SCHEMA must match ^[A-Za-z_][A-Za-z0-9_]*$".to_string());
            }
        }

        let require_internal_secret = {
            let raw = env_or("BOOKING_REQUIRE_INTERNAL_SECRET", "");
            match parse_required_bool_like(&raw) {
                Some(v) => v,
                None => prod_like,
            }
        };
        if prod_like && !require_internal_secret {
            return Err("BOOKING_REQUIRE_INTERNAL_SECRET must be true in prod/staging".to_string());
        }
        let internal_secret = env_opt("BOOKING_INTERNAL_SECRET");
        if require_internal_secret && internal_secret.is_none() {
            return Err(
                "BOOKING_INTERNAL_SECRET must be set when BOOKING_REQUIRE_INTERNAL_SECRET is enabled"
                    .to_string(),
            );
        }
        secret_policy::check_secret(
            env_kind,
            "BOOKING_INTERNAL_SECRET",
            internal_secret.as_deref(),
            false,
        )?;

        let mut internal_allowed_callers =
            parse_csv(&env_or("BOOKING_INTERNAL_ALLOWED_CALLERS", ""))
                .into_iter()
                .map(|v| v.to_ascii_lowercase())
                .collect::<Vec<_>>();
        if internal_allowed_callers.is_empty() && prod_like {
            internal_allowed_callers = vec!["edge".to_string()];
        }

        let mut allowed_origins = parse_csv(&env_or("ALLOWED_ORIGINS", ""));
        if allowed_origins.is_empty() {
            allowed_origins = vec![
                "http://localhost:5173".to_string(),
                "http://127.0.0.1:5173".to_string(),
            ];
        }
        if prod_like
            && allowed_origins
                .iter()
                .any(|o| o.trim() == "*" || !o.trim().starts_with("https://"))
        {
            return Err("ALLOWED_ORIGINS must use https:// origins in prod/staging".to_string());
        }

        let fee_bps: i64 = env_parse("PLATFORM_FEE_BPS", 200)?;
        if !(0..=10_000).contains(&fee_bps) {
            return Err("PLATFORM_FEE_BPS must be between 0 and 10000".to_string());
        }
        let currency = env_or("BOOKING_CURRENCY", "INR").trim().to_ascii_uppercase();
        if currency.len() != 3 || !currency.chars().all(|c| c.is_ascii_alphabetic()) {
            return Err("BOOKING_CURRENCY must be a three-letter ISO code".to_string());
        }
        let pending_timeout_secs: i64 = env_parse("PENDING_TIMEOUT_SECS", 1800)?;
        if pending_timeout_secs <= 0 {
            return Err("PENDING_TIMEOUT_SECS must be positive".to_string());
        }
        let cancel_cutoff_hours: i64 = env_parse("CANCEL_CUTOFF_HOURS", 0)?;
        if !(0..=24 * 30).contains(&cancel_cutoff_hours) {
            return Err("CANCEL_CUTOFF_HOURS must be between 0 and 720".to_string());
        }
        let max_rental_days: i64 = env_parse("MAX_RENTAL_DAYS", 90)?;
        if max_rental_days < 1 {
            return Err("MAX_RENTAL_DAYS must be at least 1".to_string());
        }

        let gateway_base_url = env_or("GATEWAY_BASE_URL", "http://localhost:9090")
            .trim()
            .trim_end_matches('/')
            .to_string();
        let scheme_ok = if prod_like {
            gateway_base_url.starts_with("https://")
        } else {
            gateway_base_url.starts_with("https://") || gateway_base_url.starts_with("http://")
        };
        if !scheme_ok {
            return Err(if prod_like {
                "GATEWAY_BASE_URL must use https:// in prod/staging".to_string()
            } else {
                "GATEWAY_BASE_URL must be an http(s) URL".to_string()
            });
        }
        let gateway_key_id = env_opt("GATEWAY_KEY_ID").unwrap_or_default();
        if prod_like && gateway_key_id.is_empty() {
            return Err("GATEWAY_KEY_ID must be set in prod/staging".to_string());
        }
        let gateway_key_secret = env_opt("GATEWAY_KEY_SECRET").unwrap_or_default();
        secret_policy::check_secret(
            env_kind,
            "GATEWAY_KEY_SECRET",
            Some(gateway_key_secret.as_str()),
            true,
        )?;
        let gateway_webhook_secret = env_opt("GATEWAY_WEBHOOK_SECRET").unwrap_or_default();
        secret_policy::check_secret(
            env_kind,
            "GATEWAY_WEBHOOK_SECRET",
            Some(gateway_webhook_secret.as_str()),
            true,
        )?;
        if prod_like && gateway_webhook_secret == gateway_key_secret {
            return Err("GATEWAY_WEBHOOK_SECRET must differ from GATEWAY_KEY_SECRET".to_string());
        }

        let gateway_timeout_secs = env_parse::<u64>("GATEWAY_TIMEOUT_SECS", 10)?.clamp(1, 120);
        let gateway_max_attempts = env_parse::<u32>("GATEWAY_MAX_ATTEMPTS", 3)?.clamp(1, 10);
        let gateway_backoff_ms = env_parse::<u64>("GATEWAY_BACKOFF_MS", 200)?.min(60_000);

        let refund_poll_interval_secs = env_parse::<u64>("REFUND_POLL_INTERVAL_SECS", 10)?;
        let housekeeping_interval_secs = env_parse::<u64>("HOUSEKEEPING_INTERVAL_SECS", 60)?;

        Ok(Self {
            env_name,
            env_kind,
            host,
            port,
            max_body_bytes,
            store,
            db_url,
            db_schema,
            require_internal_secret,
            internal_secret,
            internal_allowed_callers,
            allowed_origins,
            fee_bps,
            currency,
            pending_timeout_secs,
            cancel_cutoff_hours,
            max_rental_days,
            gateway_base_url,
            gateway_key_id,
            gateway_key_secret,
            gateway_webhook_secret,
            gateway_timeout_secs,
            gateway_max_attempts,
            gateway_backoff_ms,
            refund_poll_interval_secs,
            housekeeping_interval_secs,
        })
    }
}
