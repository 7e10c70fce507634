//! Microsoft 365 connector
//!
//! Talks to Microsoft Graph with client-credential auth. Fetches are mapped
//! onto the capability surface; Graph's `@odata.nextLink` is carried through
//! as the opaque page cursor. HTTP status classes map onto the connector
//! error taxonomy: 401/403 credential, 429/5xx transient, anything else
//! permanent.

use super::{
    Connector, ConnectorError, ConnectorFactory, ConnectorResult, FetchPage, RawObject,
};
use crate::error::{PostureError, Result};
use crate::types::{DataSource, DataSourceConfig};
use async_trait::async_trait;
use regex::Regex;
use serde_json::{json, Value};
use std::sync::{Arc, OnceLock};
use tokio::sync::RwLock;

const DEFAULT_GRAPH_BASE: &str = "https://graph.microsoft.com/v1.0";
const DEFAULT_LOGIN_BASE: &str = "https://login.microsoftonline.com";
const PAGE_SIZE: usize = 100;

fn upn_regex() -> &'static Regex {
    static UPN: OnceLock<Regex> = OnceLock::new();
    UPN.get_or_init(|| Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").expect("static regex"))
}

struct CachedToken {
    access_token: String,
    expires_at: i64,
}

pub struct Microsoft365Connector {
    http: reqwest::Client,
    vendor_tenant_id: String,
    client_id: String,
    client_secret: String,
    graph_base: String,
    login_base: String,
    token: RwLock<Option<CachedToken>>,
}

impl Microsoft365Connector {
    pub fn new(
        vendor_tenant_id: String,
        client_id: String,
        client_secret: String,
        graph_base: Option<String>,
        login_base: Option<String>,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            vendor_tenant_id,
            client_id,
            client_secret,
            graph_base: graph_base.unwrap_or_else(|| DEFAULT_GRAPH_BASE.to_string()),
            login_base: login_base.unwrap_or_else(|| DEFAULT_LOGIN_BASE.to_string()),
            token: RwLock::new(None),
        }
    }

    async fn bearer(&self) -> ConnectorResult<String> {
        {
            let cached = self.token.read().await;
            if let Some(token) = cached.as_ref() {
                if token.expires_at > crate::types::now_ms() + 60_000 {
                    return Ok(token.access_token.clone());
                }
            }
        }
        let url = format!("{}/{}/oauth2/v2.0/token", self.login_base, self.vendor_tenant_id);
        let response = self
            .http
            .post(&url)
            .form(&[
                ("grant_type", "client_credentials"),
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
                ("scope", "https://graph.microsoft.com/.default"),
            ])
            .send()
            .await
            .map_err(|e| ConnectorError::transient(format!("token request failed: {}", e)))?;
        if response.status() == reqwest::StatusCode::UNAUTHORIZED
            || response.status() == reqwest::StatusCode::BAD_REQUEST
        {
            return Err(ConnectorError::credential(format!(
                "token rejected for client '{}'",
                self.client_id
            )));
        }
        if !response.status().is_success() {
            return Err(classify_status(response.status(), "token endpoint"));
        }
        let body: Value = response
            .json()
            .await
            .map_err(|e| ConnectorError::transient(format!("token body unreadable: {}", e)))?;
        let access_token = body["access_token"]
            .as_str()
            .ok_or_else(|| ConnectorError::credential("token response missing access_token"))?
            .to_string();
        let expires_in = body["expires_in"].as_i64().unwrap_or(3600);
        let mut cached = self.token.write().await;
        *cached = Some(CachedToken {
            access_token: access_token.clone(),
            expires_at: crate::types::now_ms() + expires_in * 1000,
        });
        Ok(access_token)
    }

    async fn get_json(&self, url: &str) -> ConnectorResult<Value> {
        let token = self.bearer().await?;
        let response = self
            .http
            .get(url)
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| ConnectorError::transient(format!("request failed: {}", e)))?;
        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(ConnectorError::credential(format!("{} from {}", status, url)));
        }
        if !status.is_success() {
            return Err(classify_status(status, url));
        }
        response
            .json()
            .await
            .map_err(|e| ConnectorError::transient(format!("body unreadable: {}", e)))
    }

    /// One Graph collection page. The cursor, when present, is the full
    /// `@odata.nextLink` URL from the previous page.
    async fn get_page(&self, path: &str, cursor: Option<&str>) -> ConnectorResult<(Vec<Value>, Option<String>)> {
        let url = match cursor {
            Some(next_link) => next_link.to_string(),
            None => format!("{}{}", self.graph_base, path),
        };
        let body = self.get_json(&url).await?;
        let items = body["value"].as_array().cloned().unwrap_or_default();
        let next = body["@odata.nextLink"].as_str().map(|s| s.to_string());
        Ok((items, next))
    }

    async fn member_ids(&self, path: &str) -> ConnectorResult<Vec<Value>> {
        let (members, _) = self.get_page(path, None).await?;
        Ok(members)
    }
}

fn classify_status(status: reqwest::StatusCode, context: &str) -> ConnectorError {
    if status == reqwest::StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        ConnectorError::transient(format!("{} from {}", status, context))
    } else {
        ConnectorError::permanent(format!("{} from {}", status, context))
    }
}

fn parse_graph_time(value: &Value) -> Option<i64> {
    value
        .as_str()
        .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.timestamp_millis())
}

fn normalize_user(user: &Value) -> RawObject {
    let upn = user["userPrincipalName"].as_str().unwrap_or_default();
    let upn_valid = upn_regex().is_match(upn);
    let license_sku_ids: Vec<String> = user["assignedLicenses"]
        .as_array()
        .map(|licenses| {
            licenses
                .iter()
                .filter_map(|l| l["skuId"].as_str().map(|s| s.to_string()))
                .collect()
        })
        .unwrap_or_default();
    RawObject {
        external_id: user["id"].as_str().unwrap_or_default().to_string(),
        raw_data: user.clone(),
        normalized_data: json!({
            "display_name": user["displayName"].as_str().unwrap_or_default(),
            "user_principal_name": if upn_valid { upn } else { "" },
            "enabled": user["accountEnabled"].as_bool().unwrap_or(false),
            "last_login_at": parse_graph_time(&user["signInActivity"]["lastSignInDateTime"]),
            "license_sku_ids": license_sku_ids,
        }),
    }
}

fn normalize_policy(policy: &Value) -> RawObject {
    let controls: Vec<String> = policy["grantControls"]["builtInControls"]
        .as_array()
        .map(|c| {
            c.iter()
                .filter_map(|v| v.as_str().map(|s| s.to_string()))
                .collect()
        })
        .unwrap_or_default();
    let users = &policy["conditions"]["users"];
    let apps = &policy["conditions"]["applications"];
    RawObject {
        external_id: policy["id"].as_str().unwrap_or_default().to_string(),
        raw_data: policy.clone(),
        normalized_data: json!({
            "policy_kind": "conditional_access",
            "display_name": policy["displayName"].as_str().unwrap_or_default(),
            "state": policy["state"].as_str().unwrap_or("disabled"),
            "mfa_required": controls.iter().any(|c| c == "mfa"),
            "include_users": users["includeUsers"].as_array().cloned().unwrap_or_default(),
            "exclude_users": users["excludeUsers"].as_array().cloned().unwrap_or_default(),
            "include_groups": users["includeGroups"].as_array().cloned().unwrap_or_default(),
            "exclude_groups": users["excludeGroups"].as_array().cloned().unwrap_or_default(),
            "include_applications": apps["includeApplications"].as_array().cloned().unwrap_or_default(),
        }),
    }
}

#[async_trait]
impl Connector for Microsoft365Connector {
    fn slug(&self) -> &str {
        "microsoft-365"
    }

    async fn check_health(&self) -> ConnectorResult<()> {
        let url = format!("{}/organization?$select=id", self.graph_base);
        self.get_json(&url).await.map(|_| ())
    }

    async fn get_identities(&self, cursor: Option<&str>) -> ConnectorResult<FetchPage> {
        let path = format!(
            "/users?$select=id,displayName,userPrincipalName,accountEnabled,assignedLicenses,signInActivity&$top={}",
            PAGE_SIZE
        );
        let (users, next) = self.get_page(&path, cursor).await?;
        Ok(FetchPage {
            records: users.iter().map(normalize_user).collect(),
            has_more: next.is_some(),
            cursor: next,
        })
    }

    async fn get_groups(&self) -> ConnectorResult<FetchPage> {
        let (groups, _) = self
            .get_page("/groups?$select=id,displayName,groupTypes", None)
            .await?;
        let mut records = Vec::with_capacity(groups.len());
        for group in &groups {
            let id = group["id"].as_str().unwrap_or_default();
            let members = self
                .member_ids(&format!("/groups/{}/members?$select=id", id))
                .await?;
            let member_external_ids: Vec<String> = members
                .iter()
                .filter_map(|m| m["id"].as_str().map(|s| s.to_string()))
                .collect();
            records.push(RawObject {
                external_id: id.to_string(),
                raw_data: group.clone(),
                normalized_data: json!({
                    "display_name": group["displayName"].as_str().unwrap_or_default(),
                    "member_external_ids": member_external_ids,
                }),
            });
        }
        Ok(FetchPage::of(records))
    }

    async fn get_roles(&self) -> ConnectorResult<FetchPage> {
        let (roles, _) = self
            .get_page("/directoryRoles?$select=id,displayName", None)
            .await?;
        let mut records = Vec::with_capacity(roles.len());
        for role in &roles {
            let id = role["id"].as_str().unwrap_or_default();
            let members = self
                .member_ids(&format!("/directoryRoles/{}/members?$select=id", id))
                .await?;
            let member_external_ids: Vec<String> = members
                .iter()
                .filter_map(|m| m["id"].as_str().map(|s| s.to_string()))
                .collect();
            records.push(RawObject {
                external_id: id.to_string(),
                raw_data: role.clone(),
                normalized_data: json!({
                    "display_name": role["displayName"].as_str().unwrap_or_default(),
                    "member_external_ids": member_external_ids,
                }),
            });
        }
        Ok(FetchPage::of(records))
    }

    async fn get_conditional_access_policies(&self) -> ConnectorResult<FetchPage> {
        let (policies, _) = self
            .get_page("/identity/conditionalAccess/policies", None)
            .await?;
        Ok(FetchPage::of(policies.iter().map(normalize_policy).collect()))
    }

    async fn get_security_defaults_enabled(&self) -> ConnectorResult<bool> {
        let url = format!(
            "{}/policies/identitySecurityDefaultsEnforcementPolicy",
            self.graph_base
        );
        let body = self.get_json(&url).await?;
        Ok(body["isEnabled"].as_bool().unwrap_or(false))
    }

    async fn get_subscribed_skus(&self) -> ConnectorResult<FetchPage> {
        let (skus, _) = self.get_page("/subscribedSkus", None).await?;
        let records = skus
            .iter()
            .map(|sku| RawObject {
                external_id: sku["skuId"].as_str().unwrap_or_default().to_string(),
                raw_data: sku.clone(),
                normalized_data: json!({
                    "sku_id": sku["skuId"].as_str().unwrap_or_default(),
                    "sku_part_number": sku["skuPartNumber"].as_str().unwrap_or_default(),
                    "total_units": sku["prepaidUnits"]["enabled"].as_i64().unwrap_or(0),
                    "consumed_units": sku["consumedUnits"].as_i64().unwrap_or(0),
                }),
            })
            .collect();
        Ok(FetchPage::of(records))
    }

    async fn get_endpoints(&self, _tenant_cfg: &DataSourceConfig) -> ConnectorResult<FetchPage> {
        let (devices, _) = self
            .get_page(
                "/deviceManagement/managedDevices?$select=id,deviceName,operatingSystem,osVersion,lastSyncDateTime",
                None,
            )
            .await?;
        let records = devices
            .iter()
            .map(|device| RawObject {
                external_id: device["id"].as_str().unwrap_or_default().to_string(),
                raw_data: device.clone(),
                normalized_data: json!({
                    "hostname": device["deviceName"].as_str().unwrap_or_default(),
                    "os": device["operatingSystem"].as_str().unwrap_or_default(),
                    "os_version": device["osVersion"].as_str().unwrap_or_default(),
                }),
            })
            .collect();
        Ok(FetchPage::of(records))
    }

    async fn get_tenants(&self) -> ConnectorResult<FetchPage> {
        let (orgs, _) = self
            .get_page("/organization?$select=id,displayName,verifiedDomains", None)
            .await?;
        let records = orgs
            .iter()
            .map(|org| RawObject {
                external_id: org["id"].as_str().unwrap_or_default().to_string(),
                raw_data: org.clone(),
                normalized_data: json!({
                    "display_name": org["displayName"].as_str().unwrap_or_default(),
                }),
            })
            .collect();
        Ok(FetchPage::of(records))
    }
}

/// Builds Microsoft 365 connectors from a data source's stored credentials.
pub struct Microsoft365Factory {
    pub graph_base: Option<String>,
    pub login_base: Option<String>,
}

impl Microsoft365Factory {
    pub fn new() -> Self {
        Self {
            graph_base: None,
            login_base: None,
        }
    }
}

impl Default for Microsoft365Factory {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectorFactory for Microsoft365Factory {
    fn create(&self, data_source: &DataSource) -> Result<Arc<dyn Connector>> {
        let extra = &data_source.config.extra;
        let field = |name: &str| -> Result<String> {
            extra
                .get(name)
                .and_then(|v| v.as_str())
                .map(|s| s.to_string())
                .ok_or_else(|| {
                    PostureError::Configuration(format!(
                        "data source '{}' is missing '{}'",
                        data_source.id, name
                    ))
                })
        };
        Ok(Arc::new(Microsoft365Connector::new(
            field("vendor_tenant_id")?,
            field("client_id")?,
            field("client_secret")?,
            self.graph_base.clone(),
            self.login_base.clone(),
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_normalization_extracts_the_analysis_fields() {
        let user = json!({
            "id": "u-1",
            "displayName": "Alice Admin",
            "userPrincipalName": "alice@contoso.com",
            "accountEnabled": true,
            "assignedLicenses": [{"skuId": "sku-e3"}],
            "signInActivity": {"lastSignInDateTime": "2026-06-01T10:00:00Z"}
        });
        let record = normalize_user(&user);
        assert_eq!(record.external_id, "u-1");
        assert_eq!(record.normalized_data["enabled"], true);
        assert_eq!(record.normalized_data["license_sku_ids"][0], "sku-e3");
        assert!(record.normalized_data["last_login_at"].as_i64().unwrap() > 0);
    }

    #[test]
    fn malformed_upns_are_dropped_from_normalized_data() {
        let user = json!({
            "id": "u-2",
            "userPrincipalName": "not-an-upn",
            "accountEnabled": true
        });
        let record = normalize_user(&user);
        assert_eq!(record.normalized_data["user_principal_name"], "");
    }

    #[test]
    fn policy_normalization_detects_mfa_grants() {
        let policy = json!({
            "id": "p-1",
            "displayName": "Require MFA",
            "state": "enabled",
            "grantControls": {"builtInControls": ["mfa"]},
            "conditions": {
                "users": {"includeUsers": ["All"], "excludeUsers": []},
                "applications": {"includeApplications": ["All"]}
            }
        });
        let record = normalize_policy(&policy);
        assert_eq!(record.normalized_data["mfa_required"], true);
        assert_eq!(record.normalized_data["include_users"][0], "All");
    }

    #[test]
    fn http_status_classification_follows_the_taxonomy() {
        use super::super::ConnectorErrorKind;
        let err = classify_status(reqwest::StatusCode::TOO_MANY_REQUESTS, "test");
        assert_eq!(err.kind, ConnectorErrorKind::Transient);
        let err = classify_status(reqwest::StatusCode::BAD_GATEWAY, "test");
        assert_eq!(err.kind, ConnectorErrorKind::Transient);
        let err = classify_status(reqwest::StatusCode::NOT_FOUND, "test");
        assert_eq!(err.kind, ConnectorErrorKind::Permanent);
    }
}
