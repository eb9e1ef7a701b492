//! Canonical keyed store, reached over a PostgREST-style REST interface.
//!
//! The relational schema lives elsewhere; this side only knows tables, a
//! conflict key per upsert, and filter/order/limit query parameters. All
//! three operations are idempotent under retry, which is what makes
//! concurrent or repeated runs safe without locking.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde_json::Value;

use crate::fetcher::{FetchError, HttpFetcher};

/// A single column filter in PostgREST operator form.
#[derive(Debug, Clone)]
pub enum Filter {
    Eq(String, String),
    In(String, Vec<String>),
    Lt(String, i64),
}

impl Filter {
    fn to_query_pair(&self) -> (String, String) {
        match self {
            Filter::Eq(col, v) => (col.clone(), format!("eq.{}", v)),
            Filter::In(col, vs) => (col.clone(), format!("in.({})", vs.join(","))),
            Filter::Lt(col, v) => (col.clone(), format!("lt.{}", v)),
        }
    }
}

/// Point-read descriptor: filters, sort, window.
#[derive(Debug, Clone, Default)]
pub struct SelectQuery {
    pub filters: Vec<Filter>,
    /// (column, descending)
    pub order: Option<(String, bool)>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

impl SelectQuery {
    pub fn filter(mut self, f: Filter) -> Self {
        self.filters.push(f);
        self
    }

    pub fn order_by(mut self, col: &str, desc: bool) -> Self {
        self.order = Some((col.to_string(), desc));
        self
    }

    pub fn limit(mut self, n: usize) -> Self {
        self.limit = Some(n);
        self
    }
}

/// Opaque keyed store: upsert / select / patch, all idempotent.
#[async_trait]
pub trait Store: Send + Sync {
    /// Insert-or-update on the conflict key; returns the affected rows.
    async fn upsert(&self, table: &str, rows: Vec<Value>, conflict_key: &str) -> Result<Vec<Value>>;

    async fn select(&self, table: &str, query: &SelectQuery) -> Result<Vec<Value>>;

    /// Partial update of every row matching the filters; returns the count.
    async fn patch(&self, table: &str, filters: &[Filter], patch: Value) -> Result<usize>;
}

/// REST-backed store client.
pub struct RestStore {
    fetcher: HttpFetcher,
    base_url: String,
    api_key: String,
}

impl RestStore {
    pub fn new(base_url: &str, api_key: &str) -> Self {
        Self {
            fetcher: HttpFetcher::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        }
    }

    fn table_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{}", self.base_url, table)
    }

    fn auth_headers(&self) -> [(String, String); 2] {
        [
            ("apikey".to_string(), self.api_key.clone()),
            ("Authorization".to_string(), format!("Bearer {}", self.api_key)),
        ]
    }

    async fn send(
        &self,
        method: reqwest::Method,
        url: &str,
        prefer: Option<&str>,
        body: Option<&Value>,
    ) -> Result<Value> {
        let mut req = self.fetcher.client().request(method, url);
        for (k, v) in self.auth_headers() {
            req = req.header(k, v);
        }
        if let Some(p) = prefer {
            req = req.header("Prefer", p);
        }
        if let Some(b) = body {
            req = req.json(b);
        }

        // The fetcher's retry ladder applies to GETs; writes go through one
        // bounded loop here because RequestBuilder is not replayable via the
        // shared helper. Upserts and patches are idempotent, so retrying a
        // write that may have landed is safe.
        let mut last_error = String::new();
        for attempt in 0..4u32 {
            if attempt > 0 {
                tokio::time::sleep(std::time::Duration::from_millis(500 * (1 << attempt.min(3))))
                    .await;
            }
            let req = match req.try_clone() {
                Some(r) => r,
                None => bail!("request body not replayable"),
            };
            let response = match req.send().await {
                Ok(r) => r,
                Err(e) => {
                    last_error = format!("request failed: {}", e);
                    continue;
                }
            };
            let status = response.status();
            if status.is_success() {
                let text = response.text().await.unwrap_or_default();
                if text.trim().is_empty() {
                    return Ok(Value::Null);
                }
                return serde_json::from_str(&text).context("store returned invalid JSON");
            }
            if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
                last_error = format!("HTTP {}", status.as_u16());
                continue;
            }
            let body = response.text().await.unwrap_or_default();
            bail!("store error {}: {}", status.as_u16(), body);
        }
        bail!("store unreachable after retries: {}", last_error)
    }
}

#[async_trait]
impl Store for RestStore {
    async fn upsert(&self, table: &str, rows: Vec<Value>, conflict_key: &str) -> Result<Vec<Value>> {
        if rows.is_empty() {
            return Ok(vec![]);
        }
        let url = format!("{}?on_conflict={}", self.table_url(table), conflict_key);
        let result = self
            .send(
                reqwest::Method::POST,
                &url,
                Some("resolution=merge-duplicates,return=representation"),
                Some(&Value::Array(rows)),
            )
            .await?;
        match result {
            Value::Array(returned) => Ok(returned),
            Value::Null => Ok(vec![]),
            other => bail!("unexpected upsert response: {}", other),
        }
    }

    async fn select(&self, table: &str, query: &SelectQuery) -> Result<Vec<Value>> {
        let mut url = reqwest::Url::parse(&self.table_url(table)).context("bad store URL")?;
        {
            let mut pairs = url.query_pairs_mut();
            pairs.append_pair("select", "*");
            for f in &query.filters {
                let (k, v) = f.to_query_pair();
                pairs.append_pair(&k, &v);
            }
            if let Some((col, desc)) = &query.order {
                pairs.append_pair("order", &format!("{}.{}", col, if *desc { "desc" } else { "asc" }));
            }
            if let Some(limit) = query.limit {
                pairs.append_pair("limit", &limit.to_string());
            }
            if let Some(offset) = query.offset {
                pairs.append_pair("offset", &offset.to_string());
            }
        }
        let apikey = self.api_key.clone();
        let auth = format!("Bearer {}", self.api_key);
        let result = self
            .fetcher
            .get_json(url.as_str(), &[("apikey", apikey.as_str()), ("Authorization", auth.as_str())])
            .await
            .map_err(|e| match e {
                FetchError::Fatal(msg) => anyhow::anyhow!("store select failed: {}", msg),
                FetchError::Retryable(msg) => anyhow::anyhow!("store select failed: {}", msg),
            })?;
        match result {
            Value::Array(rows) => Ok(rows),
            Value::Null => Ok(vec![]),
            other => bail!("unexpected select response: {}", other),
        }
    }

    async fn patch(&self, table: &str, filters: &[Filter], patch: Value) -> Result<usize> {
        let mut url = reqwest::Url::parse(&self.table_url(table)).context("bad store URL")?;
        {
            let mut pairs = url.query_pairs_mut();
            for f in filters {
                let (k, v) = f.to_query_pair();
                pairs.append_pair(&k, &v);
            }
        }
        let result = self
            .send(
                reqwest::Method::PATCH,
                url.as_str(),
                Some("return=representation"),
                Some(&patch),
            )
            .await?;
        match result {
            Value::Array(rows) => Ok(rows.len()),
            Value::Null => Ok(0),
            _ => Ok(0),
        }
    }
}

/// In-memory store for tests, mirroring the REST semantics closely enough to
/// exercise the adapters: conflict-keyed upsert with field merge, filtered
/// select with order/limit, filtered patch. Supports poisoning a key so
/// batch-degradation paths can be exercised.
#[cfg(test)]
pub mod memory {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    struct TableData {
        rows: Vec<serde_json::Map<String, Value>>,
        next_id: i64,
    }

    #[derive(Default)]
    pub struct MemoryStore {
        tables: Mutex<HashMap<String, TableData>>,
        /// Any write containing this conflict-key value fails.
        poison_key: Mutex<Option<String>>,
    }

    impl MemoryStore {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn poison(&self, key_value: &str) {
            *self.poison_key.lock().unwrap() = Some(key_value.to_string());
        }

        pub fn rows(&self, table: &str) -> Vec<Value> {
            self.tables
                .lock()
                .unwrap()
                .get(table)
                .map(|t| t.rows.iter().cloned().map(Value::Object).collect())
                .unwrap_or_default()
        }

        fn matches(row: &serde_json::Map<String, Value>, f: &Filter) -> bool {
            match f {
                Filter::Eq(col, v) => row
                    .get(col)
                    .map(|rv| json_as_string(rv) == *v)
                    .unwrap_or(false),
                Filter::In(col, vs) => row
                    .get(col)
                    .map(|rv| vs.contains(&json_as_string(rv)))
                    .unwrap_or(false),
                Filter::Lt(col, v) => row
                    .get(col)
                    .and_then(|rv| rv.as_i64())
                    .map(|rv| rv < *v)
                    .unwrap_or(false),
            }
        }
    }

    fn json_as_string(v: &Value) -> String {
        match v {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }

    #[async_trait]
    impl Store for MemoryStore {
        async fn upsert(
            &self,
            table: &str,
            rows: Vec<Value>,
            conflict_key: &str,
        ) -> Result<Vec<Value>> {
            let poison = self.poison_key.lock().unwrap().clone();
            if let Some(poison) = &poison {
                let poisoned = rows.iter().any(|r| {
                    r.get(conflict_key)
                        .map(|v| json_as_string(v) == *poison)
                        .unwrap_or(false)
                });
                if poisoned {
                    bail!("write conflict on {}", poison);
                }
            }

            let mut tables = self.tables.lock().unwrap();
            let data = tables.entry(table.to_string()).or_default();
            let mut returned = Vec::new();

            for row in rows {
                let Value::Object(mut incoming) = row else {
                    bail!("rows must be objects");
                };
                let key = incoming
                    .get(conflict_key)
                    .map(json_as_string)
                    .context("missing conflict key")?;

                let existing = data.rows.iter_mut().find(|r| {
                    r.get(conflict_key)
                        .map(|v| json_as_string(v) == key)
                        .unwrap_or(false)
                });
                match existing {
                    Some(row) => {
                        for (k, v) in incoming {
                            row.insert(k, v);
                        }
                        returned.push(Value::Object(row.clone()));
                    }
                    None => {
                        data.next_id += 1;
                        incoming
                            .entry("id".to_string())
                            .or_insert_with(|| Value::from(data.next_id));
                        data.rows.push(incoming.clone());
                        returned.push(Value::Object(incoming));
                    }
                }
            }
            Ok(returned)
        }

        async fn select(&self, table: &str, query: &SelectQuery) -> Result<Vec<Value>> {
            let tables = self.tables.lock().unwrap();
            let Some(data) = tables.get(table) else {
                return Ok(vec![]);
            };
            let mut rows: Vec<_> = data
                .rows
                .iter()
                .filter(|r| query.filters.iter().all(|f| Self::matches(r, f)))
                .cloned()
                .collect();

            if let Some((col, desc)) = &query.order {
                rows.sort_by(|a, b| {
                    let av = a.get(col).and_then(|v| v.as_f64()).unwrap_or(0.0);
                    let bv = b.get(col).and_then(|v| v.as_f64()).unwrap_or(0.0);
                    let ord = av.partial_cmp(&bv).unwrap_or(std::cmp::Ordering::Equal);
                    if *desc {
                        ord.reverse()
                    } else {
                        ord
                    }
                });
            }
            let offset = query.offset.unwrap_or(0);
            let rows: Vec<Value> = rows
                .into_iter()
                .skip(offset)
                .take(query.limit.unwrap_or(usize::MAX))
                .map(Value::Object)
                .collect();
            Ok(rows)
        }

        async fn patch(&self, table: &str, filters: &[Filter], patch: Value) -> Result<usize> {
            let Value::Object(patch) = patch else {
                bail!("patch must be an object");
            };
            let mut tables = self.tables.lock().unwrap();
            let Some(data) = tables.get_mut(table) else {
                return Ok(0);
            };
            let mut count = 0;
            for row in data.rows.iter_mut() {
                if filters.iter().all(|f| Self::matches(row, f)) {
                    for (k, v) in &patch {
                        row.insert(k.clone(), v.clone());
                    }
                    count += 1;
                }
            }
            Ok(count)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::memory::MemoryStore;
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_upsert_inserts_then_merges() {
        let store = MemoryStore::new();
        let rows = store
            .upsert("candidates", vec![json!({"repo_id": "a/b", "stars": 5})], "repo_id")
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);

        // Second upsert merges fields, keeps the id
        let rows = store
            .upsert("candidates", vec![json!({"repo_id": "a/b", "stars": 9})], "repo_id")
            .await
            .unwrap();
        assert_eq!(rows[0]["stars"], 9);
        assert_eq!(store.rows("candidates").len(), 1);
    }

    #[tokio::test]
    async fn test_select_filters_order_limit() {
        let store = MemoryStore::new();
        store
            .upsert(
                "candidates",
                vec![
                    json!({"repo_id": "a/a", "status": "pending", "stars": 5}),
                    json!({"repo_id": "a/b", "status": "pending", "stars": 50}),
                    json!({"repo_id": "a/c", "status": "enriched", "stars": 10}),
                ],
                "repo_id",
            )
            .await
            .unwrap();

        let q = SelectQuery::default()
            .filter(Filter::Eq("status".into(), "pending".into()))
            .order_by("stars", true)
            .limit(1);
        let rows = store.select("candidates", &q).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["repo_id"], "a/b");
    }

    #[tokio::test]
    async fn test_patch_by_filter() {
        let store = MemoryStore::new();
        store
            .upsert("candidates", vec![json!({"repo_id": "a/a", "status": "pending"})], "repo_id")
            .await
            .unwrap();
        let n = store
            .patch(
                "candidates",
                &[Filter::Eq("repo_id".into(), "a/a".into())],
                json!({"status": "failed", "attempts": 1}),
            )
            .await
            .unwrap();
        assert_eq!(n, 1);
        assert_eq!(store.rows("candidates")[0]["attempts"], 1);
    }

    #[tokio::test]
    async fn test_poisoned_key_fails_writes() {
        let store = MemoryStore::new();
        store.poison("bad/repo");
        let err = store
            .upsert(
                "candidates",
                vec![json!({"repo_id": "ok/repo"}), json!({"repo_id": "bad/repo"})],
                "repo_id",
            )
            .await;
        assert!(err.is_err());
    }
}
