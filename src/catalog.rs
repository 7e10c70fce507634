//! License SKU catalog
//!
//! Maps vendor SKU identifiers to the names operators actually recognize.
//! Loaded once per process with explicit init and read-only afterwards.

use std::collections::HashMap;
use std::sync::OnceLock;

static CATALOG: OnceLock<HashMap<String, String>> = OnceLock::new();

/// Built-in catalog of commonly sold Microsoft SKUs. Extended at init time
/// with any operator-supplied entries.
fn builtin() -> Vec<(&'static str, &'static str)> {
    vec![
        ("O365_BUSINESS_ESSENTIALS", "Microsoft 365 Business Basic"),
        ("O365_BUSINESS_PREMIUM", "Microsoft 365 Business Standard"),
        ("SPB", "Microsoft 365 Business Premium"),
        ("SPE_E3", "Microsoft 365 E3"),
        ("SPE_E5", "Microsoft 365 E5"),
        ("ENTERPRISEPACK", "Office 365 E3"),
        ("ENTERPRISEPREMIUM", "Office 365 E5"),
        ("EXCHANGESTANDARD", "Exchange Online (Plan 1)"),
        ("EXCHANGEENTERPRISE", "Exchange Online (Plan 2)"),
        ("EMS", "Enterprise Mobility + Security E3"),
        ("EMSPREMIUM", "Enterprise Mobility + Security E5"),
        ("AAD_PREMIUM", "Microsoft Entra ID P1"),
        ("AAD_PREMIUM_P2", "Microsoft Entra ID P2"),
        ("DEFENDER_ENDPOINT_P1", "Microsoft Defender for Endpoint P1"),
        ("POWER_BI_PRO", "Power BI Pro"),
    ]
}

/// Initialize the process-wide catalog. Safe to call more than once; only the
/// first call wins.
pub fn init(extra: &HashMap<String, String>) {
    let _ = CATALOG.get_or_init(|| {
        let mut map: HashMap<String, String> = builtin()
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        for (k, v) in extra {
            map.insert(k.clone(), v.clone());
        }
        map
    });
}

/// Friendly name for a SKU, falling back to the raw identifier.
pub fn friendly_name(sku: &str) -> String {
    CATALOG
        .get()
        .and_then(|map| map.get(sku).cloned())
        .unwrap_or_else(|| sku.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_skus_resolve_and_unknown_fall_through() {
        init(&HashMap::new());
        assert_eq!(friendly_name("SPE_E3"), "Microsoft 365 E3");
        assert_eq!(friendly_name("SOME_UNKNOWN_SKU"), "SOME_UNKNOWN_SKU");
    }
}
