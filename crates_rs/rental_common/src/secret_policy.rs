/// Deployment environment as named by the `ENV` variable.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EnvKind {
    Dev,
    Test,
    Staging,
    Prod,
    Other,
}

impl EnvKind {
    pub fn parse(env_name: &str) -> Self {
        match env_name.trim().to_ascii_lowercase().as_str() {
            "dev" | "development" | "local" => Self::Dev,
            "test" | "ci" => Self::Test,
            "staging" => Self::Staging,
            "prod" | "production" => Self::Prod,
            _ => Self::Other,
        }
    }

    pub fn is_production_like(self) -> bool {
        matches!(self, Self::Staging | Self::Prod)
    }

    /// Environments where local conveniences (in-memory store, unsigned
    /// identity headers) are acceptable.
    pub fn is_local(self) -> bool {
        matches!(self, Self::Dev | Self::Test)
    }
}

const MIN_SECRET_LEN: usize = 16;

/// Validates a secret value for the given environment. Outside prod/staging
/// every value is accepted.
pub fn check_secret(
    env: EnvKind,
    key: &str,
    value: Option<&str>,
    required_in_prod: bool,
) -> Result<(), String> {
    if !env.is_production_like() {
        return Ok(());
    }

    let secret = value.map(str::trim).unwrap_or("");
    if secret.is_empty() {
        if required_in_prod {
            return Err(format!("{key} must be set in prod/staging"));
        }
        return Ok(());
    }
    if secret.len() < MIN_SECRET_LEN {
        return Err(format!(
            "{key} must be at least {MIN_SECRET_LEN} characters in prod/staging"
        ));
    }
    if looks_like_placeholder(secret) {
        return Err(format!(
            "{key} looks like a placeholder/default value; use a strong random secret"
        ));
    }
    if looks_like_sandbox_key(secret) {
        return Err(format!("{key} looks like a gateway sandbox credential"));
    }
    Ok(())
}

fn looks_like_placeholder(secret: &str) -> bool {
    let s = secret.to_ascii_lowercase();
    const FRAGMENTS: [&str; 12] = [
        "change-me",
        "change_me",
        "changeme",
        "replace-me",
        "replace_me",
        "your-secret",
        "your_secret",
        "dev-secret",
        "dev_secret",
        "placeholder",
        "example",
        "dummy",
    ];
    if FRAGMENTS.iter().any(|f| s.contains(f)) {
        return true;
    }
    // A single repeated character is never a real secret.
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => chars.all(|c| c == first),
        None => true,
    }
}

fn looks_like_sandbox_key(secret: &str) -> bool {
    let s = secret.to_ascii_lowercase();
    s.starts_with("test_") || s.starts_with("sandbox_") || s.starts_with("rzp_test_")
}
