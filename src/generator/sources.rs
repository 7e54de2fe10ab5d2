//! Name sources for the batch generator
//!
//! A bulk catalog dump tried across candidate endpoints in priority
//! order, and per-item fallback lookups for whatever the dump misses.

use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, warn};

use crate::download::HttpClient;
use crate::index::id_to_string;

/// Candidate bulk catalog endpoints, tried in order.
pub const BULK_ENDPOINTS: &[&str] = &[
    "https://api.steampowered.com/ISteamApps/GetAppList/v2/",
    "https://api.steampowered.com/ISteamApps/GetAppList/v0002/?format=json",
];

/// Per-item detail endpoint (appended with `?appids=<id>`)
pub const DETAILS_ENDPOINT: &str = "https://store.steampowered.com/api/appdetails";

/// Fixed back-off after an HTTP 429 before the lookup retries
pub const RATE_LIMIT_DELAY: Duration = Duration::from_secs(10);

#[derive(Deserialize)]
struct BulkPayload {
    #[serde(default)]
    applist: Option<AppList>,
    #[serde(default)]
    apps: Vec<BulkApp>,
}

#[derive(Deserialize)]
struct AppList {
    #[serde(default)]
    apps: Vec<BulkApp>,
}

#[derive(Deserialize)]
struct BulkApp {
    appid: serde_json::Value,
    #[serde(default)]
    name: Option<String>,
}

/// Normalize either observed bulk shape (`{"applist":{"apps":[...]}}` or a
/// flat `{"apps":[...]}`) into an id -> name map.
fn parse_bulk(payload: &str) -> Option<HashMap<String, String>> {
    let parsed: BulkPayload = serde_json::from_str(payload).ok()?;
    let apps = match parsed.applist {
        Some(list) if !list.apps.is_empty() => list.apps,
        _ if !parsed.apps.is_empty() => parsed.apps,
        _ => return None,
    };

    let mut names = HashMap::new();
    for app in apps {
        if let (Some(id), Some(name)) = (id_to_string(&app.appid), app.name) {
            if !name.trim().is_empty() {
                names.insert(id, name);
            }
        }
    }
    Some(names)
}

/// Try each candidate endpoint in order; the first 200 response with a
/// parseable app list wins. `None` when every candidate fails.
pub async fn fetch_bulk_catalog(
    client: &HttpClient,
    endpoints: &[String],
) -> Option<HashMap<String, String>> {
    for endpoint in endpoints {
        debug!("Trying bulk catalog endpoint: {endpoint}");
        let response = match client.inner().get(endpoint).send().await {
            Ok(r) => r,
            Err(e) => {
                warn!("Bulk endpoint unreachable ({endpoint}): {e}");
                continue;
            }
        };
        if response.status() != reqwest::StatusCode::OK {
            warn!("Bulk endpoint {} returned HTTP {}", endpoint, response.status());
            continue;
        }
        let payload = match response.text().await {
            Ok(t) => t,
            Err(e) => {
                warn!("Bulk endpoint body read failed ({endpoint}): {e}");
                continue;
            }
        };
        if let Some(names) = parse_bulk(&payload) {
            debug!("Bulk catalog: {} names from {endpoint}", names.len());
            return Some(names);
        }
        warn!("Bulk endpoint {} returned an unparseable app list", endpoint);
    }
    None
}

#[derive(Deserialize)]
struct DetailsEntry {
    success: bool,
    #[serde(default)]
    data: Option<DetailsData>,
}

#[derive(Deserialize)]
struct DetailsData {
    #[serde(default)]
    name: Option<String>,
}

#[derive(Deserialize)]
struct SearchPayload {
    #[serde(default)]
    items: Vec<SearchItem>,
}

#[derive(Deserialize)]
struct SearchItem {
    id: serde_json::Value,
    #[serde(default)]
    name: Option<String>,
}

/// One GET that backs off once on HTTP 429 before giving up on the source.
async fn get_with_backoff(
    client: &HttpClient,
    url: &str,
    query: &[(&str, &str)],
    backoff: Duration,
) -> Option<String> {
    for attempt in 0..2 {
        let response = client.inner().get(url).query(query).send().await.ok()?;
        match response.status() {
            reqwest::StatusCode::OK => return response.text().await.ok(),
            reqwest::StatusCode::TOO_MANY_REQUESTS if attempt == 0 => {
                warn!("Rate limited by {url}, backing off {}s", backoff.as_secs());
                tokio::time::sleep(backoff).await;
            }
            status => {
                debug!("Lookup source {url} returned HTTP {status}");
                return None;
            }
        }
    }
    None
}

/// Resolve one identifier's display name, trying the details endpoint and
/// then the search endpoint. `None` when every source is exhausted.
pub async fn lookup_name(
    client: &HttpClient,
    id: &str,
    details_endpoint: &str,
    search_endpoint: &str,
    backoff: Duration,
) -> Option<String> {
    if let Some(payload) =
        get_with_backoff(client, details_endpoint, &[("appids", id)], backoff).await
    {
        if let Ok(entries) = serde_json::from_str::<HashMap<String, DetailsEntry>>(&payload) {
            if let Some(entry) = entries.get(id) {
                if entry.success {
                    if let Some(name) = entry.data.as_ref().and_then(|d| d.name.clone()) {
                        return Some(name);
                    }
                }
            }
        }
    }

    if let Some(payload) = get_with_backoff(
        client,
        search_endpoint,
        &[("term", id), ("l", "english"), ("cc", "US")],
        backoff,
    )
    .await
    {
        if let Ok(parsed) = serde_json::from_str::<SearchPayload>(&payload) {
            // Only an exact id match counts; search by id is fuzzy.
            for item in parsed.items {
                if id_to_string(&item.id).as_deref() == Some(id) {
                    if let Some(name) = item.name {
                        return Some(name);
                    }
                }
            }
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bulk_applist_shape() {
        let payload = r#"{"applist": {"apps": [{"appid": 730, "name": "Counter-Strike 2"}, {"appid": 440, "name": "Team Fortress 2"}]}}"#;
        let names = parse_bulk(payload).unwrap();
        assert_eq!(names.get("730").map(String::as_str), Some("Counter-Strike 2"));
        assert_eq!(names.len(), 2);
    }

    #[test]
    fn test_parse_bulk_flat_shape() {
        let payload = r#"{"apps": [{"appid": "570", "name": "Dota 2"}]}"#;
        let names = parse_bulk(payload).unwrap();
        assert_eq!(names.get("570").map(String::as_str), Some("Dota 2"));
    }

    #[test]
    fn test_parse_bulk_skips_nameless_apps() {
        let payload = r#"{"applist": {"apps": [{"appid": 1}, {"appid": 2, "name": "  "}, {"appid": 3, "name": "Ok"}]}}"#;
        let names = parse_bulk(payload).unwrap();
        assert_eq!(names.len(), 1);
        assert!(names.contains_key("3"));
    }

    #[test]
    fn test_parse_bulk_rejects_other_documents() {
        assert!(parse_bulk(r#"{"status": "ok"}"#).is_none());
        assert!(parse_bulk("<html></html>").is_none());
    }
}
