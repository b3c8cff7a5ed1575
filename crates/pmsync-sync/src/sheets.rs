//! Google Sheets v4 access.

use async_trait::async_trait;
use pmsync_storage::{FetchError, GoogleCredentials, HttpFetcher};
use reqwest::{Method, Url};
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum SheetsError {
    #[error("spreadsheet request failed: {0}")]
    Fetch(#[from] FetchError),
    #[error("invalid spreadsheet api url {url}: {reason}")]
    Url { url: String, reason: String },
    #[error("malformed spreadsheet response: missing {0}")]
    Malformed(&'static str),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SheetInfo {
    pub sheet_id: i64,
    pub title: String,
}

/// Spreadsheet operations used by the sheet writer.
#[async_trait]
pub trait SpreadsheetApi: Send + Sync {
    async fn list_sheets(&self) -> Result<Vec<SheetInfo>, SheetsError>;
    async fn add_sheet(&self, title: &str) -> Result<i64, SheetsError>;
    async fn delete_sheet(&self, sheet_id: i64) -> Result<(), SheetsError>;
    /// Overwrite starting at A1 of `title`, user-entered semantics.
    async fn write_values(&self, title: &str, rows: &[Vec<String>]) -> Result<(), SheetsError>;
    /// A1 range such as `'Contacts'!1:1`.
    async fn read_values(&self, range: &str) -> Result<Vec<Vec<String>>, SheetsError>;
    async fn batch_update(&self, requests: Vec<JsonValue>) -> Result<(), SheetsError>;
}

#[derive(Debug, Clone)]
pub struct SheetsConfig {
    pub api_url: String,
    pub credentials: GoogleCredentials,
    pub spreadsheet_id: String,
}

impl SheetsConfig {
    pub fn new(credentials: GoogleCredentials, spreadsheet_id: impl Into<String>) -> Self {
        Self {
            api_url: "https://sheets.googleapis.com".to_string(),
            credentials,
            spreadsheet_id: spreadsheet_id.into(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct SpreadsheetMeta {
    #[serde(default)]
    sheets: Vec<SheetEntry>,
}

#[derive(Debug, Deserialize)]
struct SheetEntry {
    properties: SheetProperties,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SheetProperties {
    sheet_id: i64,
    title: String,
}

#[derive(Debug, Deserialize)]
struct ValueRange {
    #[serde(default)]
    values: Vec<Vec<JsonValue>>,
}

#[derive(Debug, Clone)]
pub struct GoogleSheetsClient {
    http: HttpFetcher,
    config: SheetsConfig,
}

impl GoogleSheetsClient {
    pub fn new(http: HttpFetcher, config: SheetsConfig) -> Self {
        Self { http, config }
    }

    fn url(&self, tail: &[&str]) -> Result<Url, SheetsError> {
        let bad = |reason: &str| SheetsError::Url {
            url: self.config.api_url.clone(),
            reason: reason.to_string(),
        };
        let mut url = Url::parse(&self.config.api_url).map_err(|e| bad(&e.to_string()))?;
        url.path_segments_mut()
            .map_err(|_| bad("cannot be a base url"))?
            .pop_if_empty()
            .extend(["v4", "spreadsheets"])
            .extend(tail);
        Ok(url)
    }

    async fn authed(
        &self,
        method: Method,
        url: &Url,
    ) -> Result<reqwest::RequestBuilder, SheetsError> {
        let token = self.config.credentials.bearer().await?;
        Ok(self.http.request(method, url.as_str()).bearer_auth(token))
    }

    async fn batch(&self, requests: Vec<JsonValue>) -> Result<JsonValue, SheetsError> {
        let url = self.url(&[&format!("{}:batchUpdate", self.config.spreadsheet_id)])?;
        let request = self
            .authed(Method::POST, &url)
            .await?
            .json(&json!({ "requests": requests }));
        Ok(self.http.send_json(request).await?)
    }
}

fn cell_text(value: &JsonValue) -> String {
    match value {
        JsonValue::String(s) => s.clone(),
        JsonValue::Null => String::new(),
        other => other.to_string(),
    }
}

#[async_trait]
impl SpreadsheetApi for GoogleSheetsClient {
    async fn list_sheets(&self) -> Result<Vec<SheetInfo>, SheetsError> {
        let url = self.url(&[&self.config.spreadsheet_id])?;
        let request = self
            .authed(Method::GET, &url)
            .await?
            .query(&[("fields", "sheets.properties(sheetId,title)")]);
        let meta: SpreadsheetMeta = self.http.send_json(request).await?;
        Ok(meta
            .sheets
            .into_iter()
            .map(|s| SheetInfo {
                sheet_id: s.properties.sheet_id,
                title: s.properties.title,
            })
            .collect())
    }

    async fn add_sheet(&self, title: &str) -> Result<i64, SheetsError> {
        let reply = self
            .batch(vec![json!({ "addSheet": { "properties": { "title": title } } })])
            .await?;
        let id = reply["replies"][0]["addSheet"]["properties"]["sheetId"]
            .as_i64()
            .ok_or(SheetsError::Malformed("addSheet.properties.sheetId"))?;
        debug!(title, sheet_id = id, "added sheet");
        Ok(id)
    }

    async fn delete_sheet(&self, sheet_id: i64) -> Result<(), SheetsError> {
        self.batch(vec![json!({ "deleteSheet": { "sheetId": sheet_id } })])
            .await?;
        Ok(())
    }

    async fn write_values(&self, title: &str, rows: &[Vec<String>]) -> Result<(), SheetsError> {
        let range = format!("{}!A1", crate::layout::quote_sheet_name(title));
        let url = self.url(&[&self.config.spreadsheet_id, "values", &range])?;
        let request = self
            .authed(Method::PUT, &url)
            .await?
            .query(&[("valueInputOption", "USER_ENTERED")])
            .json(&json!({ "range": range, "majorDimension": "ROWS", "values": rows }));
        self.http.send_empty(request).await?;
        Ok(())
    }

    async fn read_values(&self, range: &str) -> Result<Vec<Vec<String>>, SheetsError> {
        let url = self.url(&[&self.config.spreadsheet_id, "values", range])?;
        let request = self.authed(Method::GET, &url).await?;
        let values: ValueRange = self.http.send_json(request).await?;
        Ok(values
            .values
            .iter()
            .map(|row| row.iter().map(cell_text).collect())
            .collect())
    }

    async fn batch_update(&self, requests: Vec<JsonValue>) -> Result<(), SheetsError> {
        if requests.is_empty() {
            return Ok(());
        }
        self.batch(requests).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pmsync_storage::HttpClientConfig;
    use wiremock::matchers::{body_partial_json, header, method, path, path_regex, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client_for(server: &MockServer) -> GoogleSheetsClient {
        let mut config = SheetsConfig::new(GoogleCredentials::access_token("tok"), "sheet1");
        config.api_url = server.uri();
        GoogleSheetsClient::new(HttpFetcher::new(HttpClientConfig::default()).unwrap(), config)
    }

    #[tokio::test]
    async fn lists_sheet_titles_and_ids() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v4/spreadsheets/sheet1"))
            .and(header("authorization", "Bearer tok"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "sheets": [
                    {"properties": {"sheetId": 0, "title": "Sheet1"}},
                    {"properties": {"sheetId": 42, "title": "Contacts"}}
                ]
            })))
            .mount(&server)
            .await;

        let sheets = client_for(&server).list_sheets().await.unwrap();
        assert_eq!(
            sheets,
            vec![
                SheetInfo { sheet_id: 0, title: "Sheet1".into() },
                SheetInfo { sheet_id: 42, title: "Contacts".into() },
            ]
        );
    }

    #[tokio::test]
    async fn add_sheet_reads_id_from_reply() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v4/spreadsheets/sheet1:batchUpdate"))
            .and(body_partial_json(json!({
                "requests": [{"addSheet": {"properties": {"title": "Projects"}}}]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "replies": [{"addSheet": {"properties": {"sheetId": 981, "title": "Projects"}}}]
            })))
            .expect(1)
            .mount(&server)
            .await;

        assert_eq!(client_for(&server).add_sheet("Projects").await.unwrap(), 981);
    }

    #[tokio::test]
    async fn writes_user_entered_values() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path_regex(r"^/v4/spreadsheets/sheet1/values/.+"))
            .and(query_param("valueInputOption", "USER_ENTERED"))
            .and(body_partial_json(json!({"values": [["Name"], ["Ada"]]})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .expect(1)
            .mount(&server)
            .await;

        let rows = vec![vec!["Name".to_string()], vec!["Ada".to_string()]];
        client_for(&server).write_values("Contacts", &rows).await.unwrap();
    }

    #[tokio::test]
    async fn read_values_tolerates_missing_and_numeric_cells() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path_regex(r"^/v4/spreadsheets/sheet1/values/.+"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"values": [["Name", 3]]})),
            )
            .mount(&server)
            .await;

        let rows = client_for(&server).read_values("'Contacts'!1:1").await.unwrap();
        assert_eq!(rows, vec![vec!["Name".to_string(), "3".to_string()]]);
    }

    #[tokio::test]
    async fn failed_batch_surfaces_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v4/spreadsheets/sheet1:batchUpdate"))
            .respond_with(ResponseTemplate::new(400).set_body_string("Invalid requests[0]"))
            .mount(&server)
            .await;

        let err = client_for(&server)
            .batch_update(vec![json!({"setBasicFilter": {}})])
            .await
            .unwrap_err();
        match err {
            SheetsError::Fetch(e) => assert_eq!(e.status(), Some(400)),
            other => panic!("unexpected {other:?}"),
        }
    }
}
