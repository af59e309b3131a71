use anyhow::{Context, Result};
use clap::Parser;
use std::{env, str::FromStr, time::Duration};

pub const MIB: u64 = 1024 * 1024;

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub storage_dir: String,
    pub database_url: String,
    /// Origin used when building public and pre-signed URLs.
    pub public_base_url: String,
    pub signing_secret: Option<String>,
    pub max_file_size: u64,
    pub single_put_max_size: u64,
    pub url_ttl_secs: u64,
}

impl std::fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("storage_dir", &self.storage_dir)
            .field("database_url", &self.database_url)
            .field("public_base_url", &self.public_base_url)
            .field("signing_secret", &self.signing_secret.as_ref().map(|_| "<redacted>"))
            .field("max_file_size", &self.max_file_size)
            .field("single_put_max_size", &self.single_put_max_size)
            .field("url_ttl_secs", &self.url_ttl_secs)
            .finish()
    }
}

/// Command-line + environment configuration.
#[derive(Parser, Debug)]
#[command(author, version, about = "Event media upload service")]
pub struct Args {
    /// Host to bind to (overrides MEDIA_UPLOADS_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides MEDIA_UPLOADS_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Directory where objects are stored (overrides MEDIA_UPLOADS_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<String>,

    /// Database URL (overrides MEDIA_UPLOADS_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Public origin for object and signed URLs (overrides MEDIA_UPLOADS_PUBLIC_BASE_URL)
    #[arg(long)]
    pub public_base_url: Option<String>,

    /// Largest accepted upload in bytes (overrides MEDIA_UPLOADS_MAX_FILE_SIZE)
    #[arg(long)]
    pub max_file_size: Option<u64>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        let args = Args::parse();

        // --- Environment fallback ---
        let env_host = env::var("MEDIA_UPLOADS_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let env_port: u16 = env_parse("MEDIA_UPLOADS_PORT", 3000)?;
        let env_storage =
            env::var("MEDIA_UPLOADS_STORAGE_DIR").unwrap_or_else(|_| "./data/objects".into());
        let env_db = env::var("MEDIA_UPLOADS_DATABASE_URL")
            .unwrap_or_else(|_| "sqlite://./data/meta/uploads.db".into());
        let env_public = env::var("MEDIA_UPLOADS_PUBLIC_BASE_URL").ok();
        let env_max: u64 = env_parse("MEDIA_UPLOADS_MAX_FILE_SIZE", 500 * MIB)?;
        let single_put_max_size = env_parse("MEDIA_UPLOADS_SINGLE_PUT_MAX_SIZE", 50 * MIB)?;
        let url_ttl_secs = env_parse("MEDIA_UPLOADS_URL_TTL_SECS", 3600)?;
        let signing_secret = env::var("MEDIA_UPLOADS_SIGNING_SECRET")
            .ok()
            .filter(|s| !s.is_empty());

        // --- Merge ---
        let port = args.port.unwrap_or(env_port);
        let public_base_url = args
            .public_base_url
            .or(env_public)
            .unwrap_or_else(|| format!("http://127.0.0.1:{}", port));

        let cfg = Self {
            host: args.host.unwrap_or(env_host),
            port,
            storage_dir: args.storage_dir.unwrap_or(env_storage),
            database_url: args.database_url.unwrap_or(env_db),
            public_base_url: public_base_url.trim_end_matches('/').to_string(),
            signing_secret,
            max_file_size: args.max_file_size.unwrap_or(env_max),
            single_put_max_size,
            url_ttl_secs,
        };

        Ok((cfg, args.migrate))
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn upload_policy(&self) -> UploadPolicy {
        UploadPolicy {
            max_file_size: self.max_file_size,
            single_put_max_size: self.single_put_max_size.min(self.max_file_size),
            url_ttl: Duration::from_secs(self.url_ttl_secs),
            ..UploadPolicy::default()
        }
    }
}

fn env_parse<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(value) => value
            .parse::<T>()
            .with_context(|| format!("parsing {} value `{}`", name, value)),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(err) => Err(err).with_context(|| format!("reading {}", name)),
    }
}

/// Which transfer path a declared file takes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadStrategy {
    /// One pre-signed PUT of the whole object.
    SinglePut,
    /// Pre-signed PUTs per part, finalized by a completion call.
    Multipart,
}

/// Tunables of the upload path.
#[derive(Debug, Clone)]
pub struct UploadPolicy {
    /// Ceiling for the multipart path.
    pub max_file_size: u64,
    /// Ceiling for the single-PUT path; also the strategy threshold.
    pub single_put_max_size: u64,
    /// Lifetime of every pre-signed URL.
    pub url_ttl: Duration,
    pub allowed_types: Vec<String>,
}

impl Default for UploadPolicy {
    fn default() -> Self {
        Self {
            max_file_size: 500 * MIB,
            single_put_max_size: 50 * MIB,
            url_ttl: Duration::from_secs(3600),
            allowed_types: [
                "image/jpeg",
                "image/png",
                "image/gif",
                "image/webp",
                "image/heic",
                "image/heif",
                "video/mp4",
                "video/quicktime",
                "video/webm",
                "video/x-msvideo",
                "audio/mpeg",
                "audio/mp4",
                "audio/x-m4a",
                "audio/wav",
                "audio/webm",
                "audio/ogg",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
        }
    }
}

impl UploadPolicy {
    pub fn allows_type(&self, content_type: &str) -> bool {
        self.allowed_types
            .iter()
            .any(|allowed| allowed.eq_ignore_ascii_case(content_type))
    }

    /// Ceiling that applies to a strategy.
    pub fn max_size_for(&self, strategy: UploadStrategy) -> u64 {
        match strategy {
            UploadStrategy::SinglePut => self.single_put_max_size,
            UploadStrategy::Multipart => self.max_file_size,
        }
    }

    pub fn strategy_for(&self, file_size: u64) -> UploadStrategy {
        if file_size <= self.single_put_max_size {
            UploadStrategy::SinglePut
        } else {
            UploadStrategy::Multipart
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strategy_threshold_is_inclusive() {
        let policy = UploadPolicy::default();
        assert_eq!(policy.strategy_for(50 * MIB), UploadStrategy::SinglePut);
        assert_eq!(policy.strategy_for(50 * MIB + 1), UploadStrategy::Multipart);
    }

    #[test]
    fn allow_list_covers_media_only() {
        let policy = UploadPolicy::default();
        assert!(policy.allows_type("image/jpeg"));
        assert!(policy.allows_type("VIDEO/MP4"));
        assert!(policy.allows_type("audio/webm"));
        assert!(!policy.allows_type("application/pdf"));
        assert!(!policy.allows_type("text/html"));
    }
}
