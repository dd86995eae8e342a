// file: src/api.rs
// description: HTTP client for the lesson-plan service REST API under <base>/api/v1

use crate::config::ApiConfig;
use crate::types::{Job, JobId, JobStatus, service_time};
use chrono::{DateTime, Utc};
use reqwest::multipart::{Form, Part};
use serde::{Deserialize, Serialize};
use std::sync::RwLock;
use std::time::Duration;
use tracing::debug;
use url::Url;

const API_PREFIX: &str = "api/v1/";

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The service answered with a non-2xx status.
    #[error("API error ({status}): {body}")]
    Status { status: u16, body: String },

    #[error("URL parsing error: {0}")]
    Url(#[from] url::ParseError),

    #[error("API base URL cannot carry a path: {0}")]
    InvalidBaseUrl(String),
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct User {
    pub id: String,
    pub username: String,
    pub email: String,
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub quota_remaining: i64,
    #[serde(deserialize_with = "service_time::deserialize")]
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AuthToken {
    pub access_token: String,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    pub user: User,
}

fn default_token_type() -> String {
    "bearer".to_string()
}

#[derive(Serialize)]
struct RegisterRequest<'a> {
    username: &'a str,
    email: &'a str,
    password: &'a str,
}

#[derive(Serialize)]
struct LoginRequest<'a> {
    email: &'a str,
    password: &'a str,
}

/// Filter and paging for [`ApiClient::list_jobs`]. Results come newest first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListQuery {
    pub status: Option<JobStatus>,
    pub limit: u32,
    pub offset: u32,
}

impl Default for ListQuery {
    fn default() -> Self {
        Self {
            status: None,
            limit: 20,
            offset: 0,
        }
    }
}

impl ListQuery {
    fn pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = Vec::with_capacity(3);
        if let Some(status) = self.status {
            pairs.push(("status", status.as_str().to_string()));
        }
        pairs.push(("limit", self.limit.to_string()));
        pairs.push(("offset", self.offset.to_string()));
        pairs
    }
}

/// Export formats offered for completed jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportKind {
    Word,
    Pdf,
    /// Plain text; `clean` strips the annotation markup.
    Txt { clean: bool },
    Json,
    All,
}

impl ExportKind {
    fn segment(self) -> &'static str {
        match self {
            ExportKind::Word => "word",
            ExportKind::Pdf => "pdf",
            ExportKind::Txt { .. } => "txt",
            ExportKind::Json => "json",
            ExportKind::All => "all",
        }
    }

    fn query(self) -> Option<(&'static str, &'static str)> {
        match self {
            ExportKind::Txt { clean } => Some(("clean", if clean { "true" } else { "false" })),
            _ => None,
        }
    }
}

/// Lesson material for a new job: typed text or an uploaded document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobSource {
    Manual(String),
    Upload { file_name: String, bytes: Vec<u8> },
}

impl JobSource {
    fn source_type(&self) -> &'static str {
        match self {
            JobSource::Manual(_) => "manual",
            JobSource::Upload { .. } => "upload",
        }
    }
}

/// Fields of a new generation job, sent as a multipart form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateJob {
    pub title: String,
    pub subject: String,
    pub grade_level: String,
    pub specific_grade: Option<String>,
    pub region: String,
    pub teaching_model_id: String,
    pub source: JobSource,
}

impl CreateJob {
    pub fn new(
        title: impl Into<String>,
        subject: impl Into<String>,
        grade_level: impl Into<String>,
        teaching_model_id: impl Into<String>,
        source: JobSource,
    ) -> Self {
        Self {
            title: title.into(),
            subject: subject.into(),
            grade_level: grade_level.into(),
            specific_grade: None,
            region: "mainland".to_string(),
            teaching_model_id: teaching_model_id.into(),
            source,
        }
    }

    fn form(&self) -> Form {
        let mut form = Form::new()
            .text("title", self.title.clone())
            .text("subject", self.subject.clone())
            .text("grade_level", self.grade_level.clone())
            .text("region", self.region.clone())
            .text("teaching_model_id", self.teaching_model_id.clone())
            .text("source_type", self.source.source_type());
        if let Some(grade) = &self.specific_grade {
            form = form.text("specific_grade", grade.clone());
        }
        match &self.source {
            JobSource::Manual(content) => form.text("source_content", content.clone()),
            JobSource::Upload { file_name, bytes } => form.part(
                "file",
                Part::bytes(bytes.clone()).file_name(file_name.clone()),
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TeachingModel {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub name_en: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub config: serde_json::Value,
    #[serde(default)]
    pub applicable_subjects: Option<Vec<String>>,
    #[serde(default)]
    pub applicable_grades: Option<Vec<String>>,
    #[serde(default)]
    pub usage_count: i64,
}

pub struct ApiClient {
    client: reqwest::Client,
    api_root: Url,
    token: RwLock<Option<String>>,
}

impl ApiClient {
    /// `base_url` is the service root, e.g. `http://localhost:8000`.
    pub fn new(base_url: &Url, timeout: Duration) -> ApiResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("lesson-sync/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            api_root: api_root(base_url)?,
            token: RwLock::new(None),
        })
    }

    /// Returns `None` when no base URL is configured.
    pub fn from_config(config: &ApiConfig) -> ApiResult<Option<Self>> {
        let Some(base_url) = &config.base_url else {
            return Ok(None);
        };
        let client = Self::new(base_url, config.timeout)?;
        if let Some(token) = &config.token {
            client.set_token(Some(token.clone()));
        }
        Ok(Some(client))
    }

    pub fn token(&self) -> Option<String> {
        self.token
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn set_token(&self, token: Option<String>) {
        *self
            .token
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = token;
    }

    /// Creates an account and keeps the returned bearer token for later calls.
    pub async fn register(&self, username: &str, email: &str, password: &str) -> ApiResult<AuthToken> {
        let url = self.endpoint(&["auth", "register"])?;
        let body = RegisterRequest {
            username,
            email,
            password,
        };
        let token: AuthToken = Self::parse_response(self.client.post(url).json(&body).send().await?).await?;
        self.set_token(Some(token.access_token.clone()));
        debug!(user = %token.user.username, "Registered");
        Ok(token)
    }

    /// Logs in and keeps the returned bearer token for later calls.
    pub async fn login(&self, email: &str, password: &str) -> ApiResult<AuthToken> {
        let url = self.endpoint(&["auth", "login"])?;
        let body = LoginRequest { email, password };
        let token: AuthToken = Self::parse_response(self.client.post(url).json(&body).send().await?).await?;
        self.set_token(Some(token.access_token.clone()));
        debug!(user = %token.user.username, "Logged in");
        Ok(token)
    }

    pub async fn me(&self) -> ApiResult<User> {
        let url = self.endpoint(&["auth", "me"])?;
        Self::parse_response(self.authorized(self.client.get(url)).send().await?).await
    }

    pub async fn list_jobs(&self, query: &ListQuery) -> ApiResult<Vec<Job>> {
        let url = self.endpoint(&["lessons"])?;
        let request = self.authorized(self.client.get(url)).query(&query.pairs());
        Self::parse_response(request.send().await?).await
    }

    pub async fn get_job(&self, job_id: &JobId) -> ApiResult<Job> {
        let url = self.endpoint(&["lessons", job_id.as_str()])?;
        debug!(job_id = %job_id, "Fetching job");
        Self::parse_response(self.authorized(self.client.get(url)).send().await?).await
    }

    /// Queues a new generation job; the service answers with the job in `queued`.
    pub async fn create_job(&self, job: &CreateJob) -> ApiResult<Job> {
        let url = self.endpoint(&["lessons"])?;
        let request = self.authorized(self.client.post(url)).multipart(job.form());
        let created: Job = Self::parse_response(request.send().await?).await?;
        debug!(job_id = %created.id, source = job.source.source_type(), "Created job");
        Ok(created)
    }

    pub async fn list_teaching_models(&self) -> ApiResult<Vec<TeachingModel>> {
        let url = self.endpoint(&["teaching-models"])?;
        Self::parse_response(self.authorized(self.client.get(url)).send().await?).await
    }

    pub async fn get_teaching_model(&self, model_id: &str) -> ApiResult<TeachingModel> {
        let url = self.endpoint(&["teaching-models", model_id])?;
        Self::parse_response(self.authorized(self.client.get(url)).send().await?).await
    }

    pub async fn delete_job(&self, job_id: &JobId) -> ApiResult<()> {
        let url = self.endpoint(&["lessons", job_id.as_str()])?;
        let response = self.authorized(self.client.delete(url)).send().await?;
        Self::ensure_success(response).await?;
        Ok(())
    }

    /// Requests an export of a completed job; the service's JSON answer
    /// (download URL and format) is returned as-is.
    pub async fn export(&self, kind: ExportKind, job_id: &JobId) -> ApiResult<serde_json::Value> {
        let url = self.endpoint(&["export", kind.segment(), job_id.as_str()])?;
        let mut request = self.authorized(self.client.get(url));
        if let Some(pair) = kind.query() {
            request = request.query(&[pair]);
        }
        Self::parse_response(request.send().await?).await
    }

    fn endpoint(&self, segments: &[&str]) -> ApiResult<Url> {
        let mut url = self.api_root.clone();
        url.path_segments_mut()
            .map_err(|_| ApiError::InvalidBaseUrl(self.api_root.to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn authorized(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self.token() {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn ensure_success(response: reqwest::Response) -> ApiResult<reqwest::Response> {
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err(ApiError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }

    async fn parse_response<T: serde::de::DeserializeOwned>(response: reqwest::Response) -> ApiResult<T> {
        let response = Self::ensure_success(response).await?;
        Ok(response.json::<T>().await?)
    }
}

fn api_root(base_url: &Url) -> ApiResult<Url> {
    if base_url.cannot_be_a_base() {
        return Err(ApiError::InvalidBaseUrl(base_url.to_string()));
    }
    let mut base = base_url.clone();
    if !base.path().ends_with('/') {
        let path = format!("{}/", base.path());
        base.set_path(&path);
    }
    Ok(base.join(API_PREFIX)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn client(base: &str) -> ApiClient {
        ApiClient::new(&Url::parse(base).unwrap(), Duration::from_secs(5)).unwrap()
    }

    /// Serves one canned HTTP response and hands back the raw request.
    async fn one_shot_server(status_line: &str, body: &str) -> (Url, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let response = format!(
            "HTTP/1.1 {status_line}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
            body.len()
        );
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut head = Vec::new();
            let mut byte = [0u8; 1];
            while !head.ends_with(b"\r\n\r\n") {
                if socket.read(&mut byte).await.unwrap() == 0 {
                    break;
                }
                head.push(byte[0]);
            }
            let mut request = String::from_utf8_lossy(&head).into_owned();
            let length = request
                .lines()
                .find_map(|line| {
                    let (name, value) = line.split_once(':')?;
                    name.eq_ignore_ascii_case("content-length")
                        .then(|| value.trim().parse::<usize>().ok())
                        .flatten()
                })
                .unwrap_or(0);
            let mut body = vec![0u8; length];
            socket.read_exact(&mut body).await.unwrap();
            request.push_str(&String::from_utf8_lossy(&body));
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.ok();
            request
        });
        (Url::parse(&format!("http://{addr}")).unwrap(), handle)
    }

    #[test]
    fn endpoints_sit_under_api_v1() {
        let api = client("http://localhost:8000");
        assert_eq!(
            api.endpoint(&["lessons", "abc"]).unwrap().as_str(),
            "http://localhost:8000/api/v1/lessons/abc"
        );

        let prefixed = client("https://example.com/service");
        assert_eq!(
            prefixed.endpoint(&["auth", "me"]).unwrap().as_str(),
            "https://example.com/service/api/v1/auth/me"
        );
    }

    #[test]
    fn job_ids_are_escaped_as_one_segment() {
        let api = client("http://localhost:8000/");
        let url = api.endpoint(&["lessons", "a/b c"]).unwrap();
        assert_eq!(url.path(), "/api/v1/lessons/a%2Fb%20c");
    }

    #[test]
    fn list_query_pairs() {
        assert_eq!(
            ListQuery::default().pairs(),
            vec![("limit", "20".to_string()), ("offset", "0".to_string())]
        );
        let filtered = ListQuery {
            status: Some(JobStatus::Completed),
            limit: 5,
            offset: 10,
        };
        assert_eq!(filtered.pairs()[0], ("status", "completed".to_string()));
    }

    #[test]
    fn export_paths() {
        assert_eq!(ExportKind::Word.segment(), "word");
        assert_eq!(ExportKind::Txt { clean: false }.query(), Some(("clean", "false")));
        assert_eq!(ExportKind::All.query(), None);
    }

    #[test]
    fn token_payload_parses_naive_timestamps() {
        let token: AuthToken = serde_json::from_str(
            r#"{
                "access_token": "jwt",
                "user": {
                    "id": "u1",
                    "username": "mlin",
                    "email": "t@example.com",
                    "role": "user",
                    "quota_remaining": 10,
                    "created_at": "2026-03-01T08:30:00.123456"
                }
            }"#,
        )
        .unwrap();
        assert_eq!(token.token_type, "bearer");
        assert_eq!(token.user.quota_remaining, 10);
    }

    #[tokio::test]
    async fn get_job_sends_bearer_token() {
        let body = r#"{"id":"abc","title":"Fractions","subject":"math","grade_level":"5",
            "region":"north","status":"processing","progress":40,"current_stage":2,
            "created_at":"2026-03-01T08:30:00"}"#;
        let (base, server) = one_shot_server("200 OK", body).await;
        let api = ApiClient::new(&base, Duration::from_secs(5)).unwrap();
        api.set_token(Some("secret".into()));

        let job = api.get_job(&JobId::from("abc")).await.unwrap();
        assert_eq!(job.status, JobStatus::Processing);
        assert_eq!(job.snapshot().progress, 40);

        let head = server.await.unwrap().to_lowercase();
        assert!(head.starts_with("get /api/v1/lessons/abc "));
        assert!(head.contains("authorization: bearer secret"));
    }

    #[tokio::test]
    async fn non_success_maps_to_status_error() {
        let (base, _server) = one_shot_server("404 Not Found", r#"{"detail":"not found"}"#).await;
        let api = ApiClient::new(&base, Duration::from_secs(5)).unwrap();

        match api.get_job(&JobId::from("missing")).await {
            Err(ApiError::Status { status, body }) => {
                assert_eq!(status, 404);
                assert!(body.contains("not found"));
            }
            other => panic!("expected status error, got {other:?}"),
        }
    }

    #[test]
    fn from_config_without_base_is_none() {
        let config = ApiConfig {
            base_url: None,
            token: Some("t".into()),
            timeout: Duration::from_secs(1),
        };
        assert!(ApiClient::from_config(&config).unwrap().is_none());
    }

    const QUEUED_JOB: &str = r#"{"id":"new-1","title":"Fractions","subject":"math",
        "grade_level":"primary","region":"mainland","status":"queued","progress":0,
        "created_at":"2026-03-01T08:30:00"}"#;

    #[tokio::test]
    async fn create_job_posts_manual_source_as_multipart() {
        let (base, server) = one_shot_server("201 Created", QUEUED_JOB).await;
        let api = ApiClient::new(&base, Duration::from_secs(5)).unwrap();
        api.set_token(Some("secret".into()));

        let mut request = CreateJob::new(
            "Fractions",
            "math",
            "primary",
            "model-5e",
            JobSource::Manual("Halves and quarters".into()),
        );
        request.specific_grade = Some("grade 5".into());
        let job = api.create_job(&request).await.unwrap();
        assert_eq!(job.id, JobId::from("new-1"));
        assert_eq!(job.snapshot().status, JobStatus::Queued);

        let raw = server.await.unwrap();
        let lower = raw.to_lowercase();
        assert!(lower.starts_with("post /api/v1/lessons "));
        assert!(lower.contains("content-type: multipart/form-data; boundary="));
        assert!(lower.contains("authorization: bearer secret"));
        for (name, value) in [
            ("title", "Fractions"),
            ("subject", "math"),
            ("grade_level", "primary"),
            ("specific_grade", "grade 5"),
            ("region", "mainland"),
            ("teaching_model_id", "model-5e"),
            ("source_type", "manual"),
            ("source_content", "Halves and quarters"),
        ] {
            let field = format!("name=\"{name}\"\r\n\r\n{value}\r\n");
            assert!(raw.contains(&field), "missing field {name} in {raw}");
        }
        assert!(!raw.contains("name=\"file\""));
    }

    #[tokio::test]
    async fn create_job_uploads_file_part() {
        let (base, server) = one_shot_server("201 Created", QUEUED_JOB).await;
        let api = ApiClient::new(&base, Duration::from_secs(5)).unwrap();

        let request = CreateJob::new(
            "Fractions",
            "math",
            "primary",
            "model-5e",
            JobSource::Upload {
                file_name: "notes.txt".into(),
                bytes: b"chapter three".to_vec(),
            },
        );
        api.create_job(&request).await.unwrap();

        let raw = server.await.unwrap();
        assert!(raw.contains("name=\"source_type\"\r\n\r\nupload\r\n"));
        assert!(raw.contains("name=\"file\"; filename=\"notes.txt\""));
        assert!(raw.contains("chapter three"));
        assert!(!raw.contains("name=\"source_content\""));
    }

    #[tokio::test]
    async fn teaching_models_are_listed() {
        let body = r#"[{"id":"model-5e","name":"5E","type":"inquiry",
            "config":{"stages":5},"applicable_subjects":["science"],"usage_count":12}]"#;
        let (base, server) = one_shot_server("200 OK", body).await;
        let api = ApiClient::new(&base, Duration::from_secs(5)).unwrap();

        let models = api.list_teaching_models().await.unwrap();
        assert_eq!(models.len(), 1);
        assert_eq!(models[0].kind, "inquiry");
        assert_eq!(models[0].usage_count, 12);
        assert_eq!(models[0].applicable_grades, None);

        let head = server.await.unwrap().to_lowercase();
        assert!(head.starts_with("get /api/v1/teaching-models "));
    }
}
