//! API key issuance, validation and authorization.
//!
//! Raw keys are `ak_` plus 32 bytes of URL-safe base64 randomness and are
//! never persisted; the store is addressed by an HMAC-SHA256 of the raw key
//! under a deployment secret. A 16-hex `key_id` names records in admin
//! surfaces without leaking key material.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use thiserror::Error;

use crate::kv::{KvClient, KvError};
use crate::model::{ApiKeyRecord, ApiKeyStatus, Permission, Tier};

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("credential store unavailable: {0}")]
    Unavailable(String),
    #[error("malformed key record: {0}")]
    Corrupt(String),
}

impl From<KvError> for AuthError {
    fn from(err: KvError) -> Self {
        AuthError::Unavailable(err.to_string())
    }
}

/// Identity attached to an authenticated request.
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub user_id: String,
    pub key_id: String,
    pub tier: Tier,
    pub permissions: Vec<Permission>,
}

impl AuthContext {
    pub fn has_permission(&self, permission: Permission) -> bool {
        self.permissions.contains(&permission) || self.permissions.contains(&Permission::Admin)
    }

    pub fn meets_tier(&self, required: Tier) -> bool {
        self.tier >= required
    }
}

/// A freshly created key. The raw key appears here once and nowhere else.
#[derive(Debug, Clone)]
pub struct IssuedKey {
    pub api_key: String,
    pub record: ApiKeyRecord,
}

#[derive(Clone)]
pub struct ApiKeyStore {
    kv: KvClient,
    secret: String,
    prefix: String,
    default_expiry_days: Option<u32>,
}

impl ApiKeyStore {
    pub fn new(
        kv: KvClient,
        secret: impl Into<String>,
        prefix: impl Into<String>,
        default_expiry_days: Option<u32>,
    ) -> Self {
        Self {
            kv,
            secret: secret.into(),
            prefix: prefix.into(),
            default_expiry_days,
        }
    }

    /// HMAC-SHA256 of the raw key; the only derivative of the key that ever
    /// reaches the store.
    pub fn key_hash(&self, raw_key: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes())
            .expect("HMAC accepts keys of any length");
        mac.update(raw_key.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn generate_raw_key(&self) -> String {
        use base64::engine::general_purpose::URL_SAFE_NO_PAD;
        use base64::Engine;
        let mut material = [0u8; 32];
        OsRng.fill_bytes(&mut material);
        format!("{}{}", self.prefix, URL_SAFE_NO_PAD.encode(material))
    }

    fn generate_key_id() -> String {
        let mut raw = [0u8; 8];
        OsRng.fill_bytes(&mut raw);
        hex::encode(raw)
    }

    pub async fn create(
        &self,
        user_id: &str,
        tier: Tier,
        permissions: Vec<Permission>,
        expires_days: Option<u32>,
    ) -> Result<IssuedKey, AuthError> {
        let api_key = self.generate_raw_key();
        let key_id = Self::generate_key_id();
        let expires_at = expires_days
            .or(self.default_expiry_days)
            .map(|days| Utc::now() + ChronoDuration::days(i64::from(days)));

        let record = ApiKeyRecord {
            key_id: key_id.clone(),
            user_id: user_id.to_string(),
            tier,
            permissions: if permissions.is_empty() {
                vec![Permission::Read]
            } else {
                permissions
            },
            status: ApiKeyStatus::Active,
            created_at: Utc::now(),
            last_used_at: None,
            expires_at,
        };

        let hash = self.key_hash(&api_key);
        self.kv
            .hset_all(&record_key(&hash), &record_fields(&record))
            .await?;
        self.kv
            .sadd(&format!("user_keys:{user_id}"), &key_id)
            .await?;

        tracing::info!(user_id, key_id, tier = tier.as_str(), "api key created");
        Ok(IssuedKey { api_key, record })
    }

    /// Validate a raw key. `Ok(None)` means the key is unknown, expired or
    /// revoked; infrastructure failures surface as errors so the caller can
    /// answer 503 instead of 401.
    pub async fn validate(&self, raw_key: &str) -> Result<Option<AuthContext>, AuthError> {
        if !raw_key.starts_with(&self.prefix) {
            return Ok(None);
        }

        let hash = self.key_hash(raw_key);
        let fields = self.kv.hget_all(&record_key(&hash)).await?;
        if fields.is_empty() {
            tracing::warn!("unknown api key presented");
            return Ok(None);
        }

        let record = record_from_fields(&fields)?;

        if record.status != ApiKeyStatus::Active {
            tracing::warn!(key_id = %record.key_id, "revoked api key presented");
            return Ok(None);
        }
        if let Some(expires_at) = record.expires_at {
            if expires_at < Utc::now() {
                tracing::warn!(key_id = %record.key_id, "expired api key presented");
                return Ok(None);
            }
        }

        self.kv
            .hset(
                &record_key(&hash),
                "last_used_at",
                &Utc::now().to_rfc3339(),
            )
            .await?;

        Ok(Some(AuthContext {
            user_id: record.user_id,
            key_id: record.key_id,
            tier: record.tier,
            permissions: record.permissions,
        }))
    }

    pub async fn list_for_user(&self, user_id: &str) -> Result<Vec<ApiKeyRecord>, AuthError> {
        let key_ids = self.kv.smembers(&format!("user_keys:{user_id}")).await?;
        if key_ids.is_empty() {
            return Ok(Vec::new());
        }

        // Record keys are HMACs, so listing has to scan. Admin-only path.
        let mut records = Vec::new();
        for key_name in self.kv.scan_match("api_key:*").await? {
            let fields = self.kv.hget_all(&key_name).await?;
            if fields.is_empty() {
                continue;
            }
            let record = record_from_fields(&fields)?;
            if record.user_id == user_id && key_ids.contains(&record.key_id) {
                records.push(record);
            }
        }
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(records)
    }

    /// Mark a key revoked. Returns false when no such key exists for the
    /// user.
    pub async fn revoke(&self, user_id: &str, key_id: &str) -> Result<bool, AuthError> {
        for key_name in self.kv.scan_match("api_key:*").await? {
            let fields = self.kv.hget_all(&key_name).await?;
            if fields.get("key_id").map(String::as_str) == Some(key_id)
                && fields.get("user_id").map(String::as_str) == Some(user_id)
            {
                self.kv
                    .hset(&key_name, "status", ApiKeyStatus::Revoked.as_str())
                    .await?;
                self.kv
                    .srem(&format!("user_keys:{user_id}"), key_id)
                    .await?;
                tracing::info!(user_id, key_id, "api key revoked");
                return Ok(true);
            }
        }
        Ok(false)
    }
}

fn record_key(hash: &str) -> String {
    format!("api_key:{hash}")
}

fn record_fields(record: &ApiKeyRecord) -> Vec<(String, String)> {
    let mut fields = vec![
        ("key_id".into(), record.key_id.clone()),
        ("user_id".into(), record.user_id.clone()),
        ("tier".into(), record.tier.as_str().into()),
        (
            "permissions".into(),
            record
                .permissions
                .iter()
                .map(|p| p.as_str())
                .collect::<Vec<_>>()
                .join(","),
        ),
        ("status".into(), record.status.as_str().into()),
        ("created_at".into(), record.created_at.to_rfc3339()),
    ];
    if let Some(expires_at) = record.expires_at {
        fields.push(("expires_at".into(), expires_at.to_rfc3339()));
    }
    if let Some(last_used_at) = record.last_used_at {
        fields.push(("last_used_at".into(), last_used_at.to_rfc3339()));
    }
    fields
}

fn record_from_fields(
    fields: &std::collections::HashMap<String, String>,
) -> Result<ApiKeyRecord, AuthError> {
    let get = |name: &str| {
        fields
            .get(name)
            .cloned()
            .ok_or_else(|| AuthError::Corrupt(format!("missing field {name}")))
    };

    let parse_time = |value: &str| {
        DateTime::parse_from_rfc3339(value)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|err| AuthError::Corrupt(format!("bad timestamp: {err}")))
    };

    let permissions = get("permissions")?
        .split(',')
        .filter(|p| !p.is_empty())
        .map(|p| {
            Permission::try_from(p).map_err(|_| AuthError::Corrupt(format!("bad permission {p}")))
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(ApiKeyRecord {
        key_id: get("key_id")?,
        user_id: get("user_id")?,
        tier: Tier::try_from(get("tier")?.as_str())
            .map_err(|_| AuthError::Corrupt("bad tier".into()))?,
        permissions,
        status: ApiKeyStatus::try_from(get("status")?.as_str())
            .map_err(|_| AuthError::Corrupt("bad status".into()))?,
        created_at: parse_time(&get("created_at")?)?,
        last_used_at: fields
            .get("last_used_at")
            .map(|value| parse_time(value))
            .transpose()?,
        expires_at: fields
            .get("expires_at")
            .map(|value| parse_time(value))
            .transpose()?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn hmac_is_stable_and_keyed_by_secret() {
        let hash = |secret: &str, key: &str| {
            let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
            mac.update(key.as_bytes());
            hex::encode(mac.finalize().into_bytes())
        };

        let a = hash("secret-one", "ak_example");
        let b = hash("secret-one", "ak_example");
        let c = hash("secret-two", "ak_example");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn record_round_trips_through_fields() {
        let record = ApiKeyRecord {
            key_id: "0123456789abcdef".into(),
            user_id: "user-7".into(),
            tier: Tier::Premium,
            permissions: vec![Permission::Read, Permission::Write],
            status: ApiKeyStatus::Active,
            created_at: Utc::now(),
            last_used_at: None,
            expires_at: Some(Utc::now() + ChronoDuration::days(30)),
        };

        let fields: HashMap<String, String> = record_fields(&record).into_iter().collect();
        let parsed = record_from_fields(&fields).unwrap();

        assert_eq!(parsed.key_id, record.key_id);
        assert_eq!(parsed.tier, Tier::Premium);
        assert_eq!(parsed.permissions, record.permissions);
        assert_eq!(parsed.status, ApiKeyStatus::Active);
        assert!(parsed.expires_at.is_some());
    }

    #[test]
    fn stored_fields_never_contain_key_material() {
        let record = ApiKeyRecord {
            key_id: "feedfacefeedface".into(),
            user_id: "user-1".into(),
            tier: Tier::Basic,
            permissions: vec![Permission::Read],
            status: ApiKeyStatus::Active,
            created_at: Utc::now(),
            last_used_at: None,
            expires_at: None,
        };

        // A raw key is prefix + 43 chars of base64; no stored field is ever
        // that shape.
        for (_, value) in record_fields(&record) {
            assert!(!value.starts_with("ak_"));
        }
    }

    #[test]
    fn corrupt_records_are_rejected() {
        let mut fields = HashMap::new();
        fields.insert("key_id".to_string(), "abc".to_string());
        assert!(matches!(
            record_from_fields(&fields),
            Err(AuthError::Corrupt(_))
        ));
    }

    #[test]
    fn admin_implies_every_permission() {
        let context = AuthContext {
            user_id: "ops".into(),
            key_id: "k".into(),
            tier: Tier::Enterprise,
            permissions: vec![Permission::Admin],
        };
        assert!(context.has_permission(Permission::Read));
        assert!(context.has_permission(Permission::Write));
        assert!(context.has_permission(Permission::Admin));
        assert!(context.meets_tier(Tier::Premium));
    }

    #[test]
    fn tier_check_is_ordered() {
        let context = AuthContext {
            user_id: "u".into(),
            key_id: "k".into(),
            tier: Tier::Standard,
            permissions: vec![Permission::Read],
        };
        assert!(context.meets_tier(Tier::Basic));
        assert!(context.meets_tier(Tier::Standard));
        assert!(!context.meets_tier(Tier::Premium));
        assert!(!context.has_permission(Permission::Write));
    }
}
