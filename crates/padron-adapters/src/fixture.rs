use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use tokio::sync::Mutex;

use crate::{FetchError, FetchParams, RegistryClient, RegistryPage};

/// Serves canned upstream responses, page `n` being the `n`-th entry. Pages past the end are empty.
#[derive(Debug, Default)]
pub struct FixtureRegistryClient {
    pages: Vec<RegistryPage>,
    requests: Mutex<Vec<FetchParams>>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum FixtureFile {
    Pages(Vec<RegistryPage>),
    Single(RegistryPage),
}

impl FixtureRegistryClient {
    pub fn from_pages(pages: Vec<RegistryPage>) -> Self {
        Self {
            pages,
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Reads either a JSON array of pages or one page object.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        let file: FixtureFile =
            serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))?;
        let pages = match file {
            FixtureFile::Pages(pages) => pages,
            FixtureFile::Single(page) => vec![page],
        };
        Ok(Self::from_pages(pages))
    }

    /// Every `fetch` call seen so far, in order.
    pub async fn requests(&self) -> Vec<FetchParams> {
        self.requests.lock().await.clone()
    }

    fn find(&self, field: &str, key: &str) -> Option<JsonValue> {
        let key = key.trim();
        self.pages
            .iter()
            .flat_map(|page| page.items())
            .find(|record| match record.get(field) {
                Some(JsonValue::String(s)) => s.trim() == key,
                Some(JsonValue::Number(n)) => n.to_string() == key,
                _ => false,
            })
            .cloned()
    }
}

#[async_trait]
impl RegistryClient for FixtureRegistryClient {
    async fn fetch(&self, params: &FetchParams) -> Result<RegistryPage, FetchError> {
        self.requests.lock().await.push(params.clone());
        let index = params.page.saturating_sub(1) as usize;
        Ok(self.pages.get(index).cloned().unwrap_or_default())
    }

    async fn fetch_by_primary_key(&self, key: &str) -> Result<Option<JsonValue>, FetchError> {
        Ok(self.find("dni", key))
    }

    async fn fetch_by_secondary_key(&self, key: &str) -> Result<Option<JsonValue>, FetchError> {
        Ok(self.find("sid", key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn loads_page_list_and_serves_past_the_end_as_empty() {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        write!(
            file,
            r#"[
                {{"data": [{{"dni": "30111222", "sid": "S-1"}}], "pagination": {{"current_page": 1, "last_page": 2}}}},
                {{"data": [{{"dni": 30999888}}], "server_time": "2026-02-01T03:00:00Z"}}
            ]"#
        )
        .expect("write fixture");

        let client = FixtureRegistryClient::from_path(file.path()).expect("load");
        let params = |page| FetchParams {
            watermark: None,
            page,
            page_size: 1,
        };
        assert_eq!(client.fetch(&params(1)).await.unwrap().items().len(), 1);
        assert_eq!(
            client.fetch(&params(2)).await.unwrap().server_time.as_deref(),
            Some("2026-02-01T03:00:00Z")
        );
        assert!(client.fetch(&params(3)).await.unwrap().data.is_none());
        assert_eq!(client.requests().await.len(), 3);

        assert!(client.fetch_by_primary_key("30999888").await.unwrap().is_some());
        assert!(client.fetch_by_secondary_key(" S-1 ").await.unwrap().is_some());
        assert!(client.fetch_by_secondary_key("S-2").await.unwrap().is_none());
    }

    #[test]
    fn single_page_object_is_accepted() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("page.json");
        fs::write(&path, r#"{"data": []}"#).expect("write");
        let client = FixtureRegistryClient::from_path(&path).expect("load");
        assert_eq!(client.pages.len(), 1);
    }
}
