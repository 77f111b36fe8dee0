use std::env;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

const DEV_JWT_SECRET: &str = "shared-todo-dev-secret";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {name}: {value}")]
    InvalidValue { name: &'static str, value: String },

    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),
}

/// 使用するバックエンドストア
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Memory,
    DynamoDb,
}

impl FromStr for StoreBackend {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "memory" => Ok(StoreBackend::Memory),
            "dynamodb" => Ok(StoreBackend::DynamoDb),
            _ => Err(ConfigError::InvalidValue {
                name: "STORE_BACKEND",
                value: s.to_string(),
            }),
        }
    }
}

impl fmt::Display for StoreBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreBackend::Memory => f.write_str("memory"),
            StoreBackend::DynamoDb => f.write_str("dynamodb"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub store_backend: StoreBackend,
    pub dynamodb_table: String,
    /// DynamoDB Local などの接続先を上書きする場合に指定
    pub dynamodb_endpoint: Option<String>,
    pub environment: String,
    pub aws_region: String,
    pub port: u16,
    pub jwt_secret: String,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// 環境変数の参照方法を差し替えられる版（テスト用）
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let environment = lookup("ENVIRONMENT").unwrap_or_else(|| "dev".to_string());

        let store_backend = match lookup("STORE_BACKEND") {
            Some(value) => value.parse()?,
            None => StoreBackend::Memory,
        };

        let port = match lookup("PORT") {
            Some(value) => value.parse().map_err(|_| ConfigError::InvalidValue {
                name: "PORT",
                value,
            })?,
            None => 3000,
        };

        // dev 以外では署名鍵の明示を必須にする
        let jwt_secret = match lookup("JWT_SECRET") {
            Some(secret) if !secret.is_empty() => secret,
            _ if environment == "dev" => DEV_JWT_SECRET.to_string(),
            _ => return Err(ConfigError::Missing("JWT_SECRET")),
        };

        Ok(Config {
            store_backend,
            dynamodb_table: lookup("DYNAMODB_TABLE")
                .unwrap_or_else(|| "shared-todo-dev".to_string()),
            dynamodb_endpoint: lookup("DYNAMODB_ENDPOINT").filter(|e| !e.is_empty()),
            environment,
            aws_region: lookup("AWS_REGION").unwrap_or_else(|| "ap-northeast-1".to_string()),
            port,
            jwt_secret,
        })
    }
}
