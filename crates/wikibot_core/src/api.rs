use std::collections::BTreeMap;
use std::env;
use std::thread::sleep;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result, bail};
use reqwest::blocking::Client;
use reqwest::{StatusCode, Url};
use serde::Deserialize;
use serde_json::Value;

use crate::cluster::LangLinks;
use crate::config::{BotConfig, Credentials, Project};
use crate::storage::Checkpoint;

pub const EDIT_SUCCESS: &str = "Success";

/// One page of the site-wide title listing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TitleBatch {
    pub titles: Vec<String>,
    /// `None` once the listing is exhausted.
    pub next: Option<Checkpoint>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageLookup {
    Missing,
    Found(LangLinks),
}

#[derive(Debug, Clone)]
pub struct EditRequest<'a> {
    pub language: &'a str,
    pub title: &'a str,
    pub text: &'a str,
    pub summary: &'a str,
    pub token: &'a str,
}

#[derive(Debug, Clone)]
pub struct EditResponse {
    pub result: Option<String>,
    pub raw: Value,
}

impl EditResponse {
    pub fn is_success(&self) -> bool {
        self.result.as_deref() == Some(EDIT_SUCCESS)
    }
}

/// Language-addressed view of a wiki family.
pub trait WikiApi {
    fn list_titles(&mut self, language: &str, from: Option<&Checkpoint>) -> Result<TitleBatch>;
    fn get_lang_links(&mut self, language: &str, title: &str) -> Result<PageLookup>;
    fn get_content(&mut self, language: &str, title: &str) -> Result<String>;
    fn get_csrf_token(&mut self, language: &str) -> Result<String>;
    fn edit(&mut self, request: &EditRequest<'_>) -> Result<EditResponse>;
    fn request_count(&self) -> usize;
}

#[derive(Debug, Clone)]
pub struct MediaWikiClientConfig {
    pub api_url: String,
    pub user_agent: String,
    pub timeout_ms: u64,
    pub rate_limit_read_ms: u64,
    pub rate_limit_write_ms: u64,
    pub max_retries: usize,
    pub retry_delay_ms: u64,
    pub list_limit: usize,
}

impl MediaWikiClientConfig {
    pub fn from_env(api_url: &str, user_agent: &str) -> Self {
        Self {
            api_url: api_url.to_string(),
            user_agent: user_agent.to_string(),
            timeout_ms: env_value_u64("WIKI_HTTP_TIMEOUT_MS", 30_000),
            rate_limit_read_ms: env_value_u64("WIKI_RATE_LIMIT_READ", 300),
            rate_limit_write_ms: env_value_u64("WIKI_RATE_LIMIT_WRITE", 1_000),
            max_retries: env_value_usize("WIKI_HTTP_RETRIES", 2),
            retry_delay_ms: env_value_u64("WIKI_HTTP_RETRY_DELAY_MS", 500),
            list_limit: env_value_usize("WIKI_LIST_LIMIT", 50),
        }
    }
}

/// Client for a single `api.php` endpoint, i.e. one language edition.
pub struct MediaWikiClient {
    client: Client,
    config: MediaWikiClientConfig,
    last_request_at: Option<Instant>,
    request_count: usize,
}

impl MediaWikiClient {
    pub fn new(config: MediaWikiClientConfig) -> Result<Self> {
        Url::parse(&config.api_url)
            .with_context(|| format!("invalid API URL: {}", config.api_url))?;
        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .cookie_store(true)
            .build()
            .context("failed to build MediaWiki HTTP client")?;

        Ok(Self {
            client,
            config,
            last_request_at: None,
            request_count: 0,
        })
    }

    pub fn request_count(&self) -> usize {
        self.request_count
    }

    pub fn all_pages(&mut self, from: Option<&Checkpoint>) -> Result<TitleBatch> {
        let mut params = vec![
            ("action", "query".to_string()),
            ("list", "allpages".to_string()),
            ("aplimit", self.config.list_limit.to_string()),
        ];
        if let Some(checkpoint) = from {
            if let Some(token) = &checkpoint.continue_token {
                params.push(("continue", token.clone()));
            }
            if let Some(token) = &checkpoint.ap_continue {
                params.push(("apcontinue", token.clone()));
            }
        }

        let response = self.request_json_get(&params)?;
        let parsed: QueryResponse =
            serde_json::from_value(response).context("failed to decode allpages API response")?;

        let next = parsed
            .continuation
            .map(|cont| Checkpoint {
                continue_token: cont.continue_token,
                ap_continue: cont.apcontinue,
            })
            .filter(|checkpoint| !checkpoint.is_empty());

        Ok(TitleBatch {
            titles: parsed
                .query
                .allpages
                .into_iter()
                .map(|item| item.title)
                .collect(),
            next,
        })
    }

    pub fn lang_links(&mut self, title: &str) -> Result<PageLookup> {
        let mut links = LangLinks::new();
        let mut continuation: Option<ContinuationPayload> = None;

        loop {
            let mut params = vec![
                ("action", "query".to_string()),
                ("titles", title.to_string()),
                ("prop", "langlinks".to_string()),
                ("lllimit", "max".to_string()),
            ];
            if let Some(cont) = &continuation {
                params.push(("continue", cont.continue_token.clone().unwrap_or_default()));
                params.push(("llcontinue", cont.llcontinue.clone().unwrap_or_default()));
            }

            let response = self.request_json_get(&params)?;
            let parsed: QueryResponse = serde_json::from_value(response)
                .context("failed to decode langlinks API response")?;
            let page = parsed
                .query
                .pages
                .into_iter()
                .next()
                .ok_or_else(|| anyhow::anyhow!("langlinks response has no page for {title}"))?;
            if page.missing || page.invalid {
                return Ok(PageLookup::Missing);
            }
            for link in page.langlinks {
                links.insert(link.lang, link.title);
            }

            continuation = parsed
                .continuation
                .filter(|cont| cont.llcontinue.is_some());
            if continuation.is_none() {
                break;
            }
        }

        Ok(PageLookup::Found(links))
    }

    pub fn content(&mut self, title: &str) -> Result<String> {
        let response = self.request_json_get(&[
            ("action", "query".to_string()),
            ("titles", title.to_string()),
            ("prop", "revisions".to_string()),
            ("rvprop", "content".to_string()),
            ("rvslots", "main".to_string()),
        ])?;
        let parsed: QueryResponse = serde_json::from_value(response)
            .context("failed to decode page content API response")?;
        let page = parsed
            .query
            .pages
            .into_iter()
            .next()
            .ok_or_else(|| anyhow::anyhow!("content response has no page for {title}"))?;
        if page.missing || page.invalid {
            bail!("page is missing: {title}");
        }
        page.revisions
            .into_iter()
            .next()
            .and_then(|revision| revision.slots)
            .and_then(|slots| slots.main)
            .map(|slot| slot.content)
            .ok_or_else(|| anyhow::anyhow!("no revision content returned for {title}"))
    }

    pub fn csrf_token(&mut self) -> Result<String> {
        let response = self.request_json_get(&[
            ("action", "query".to_string()),
            ("meta", "tokens".to_string()),
            ("type", "csrf".to_string()),
        ])?;
        let parsed: TokenQueryResponse =
            serde_json::from_value(response).context("failed to decode csrf token response")?;
        parsed
            .query
            .tokens
            .and_then(|tokens| tokens.csrftoken)
            .ok_or_else(|| anyhow::anyhow!("failed to get MediaWiki csrf token"))
    }

    pub fn login(&mut self, username: &str, password: &str) -> Result<()> {
        let token_response = self.request_json_get(&[
            ("action", "query".to_string()),
            ("meta", "tokens".to_string()),
            ("type", "login".to_string()),
        ])?;
        let token_payload: TokenQueryResponse = serde_json::from_value(token_response)
            .context("failed to decode login token response")?;
        let login_token = token_payload
            .query
            .tokens
            .and_then(|tokens| tokens.logintoken)
            .ok_or_else(|| anyhow::anyhow!("failed to get MediaWiki login token"))?;

        let login_response = self.request_json_post(
            &[
                ("action", "login".to_string()),
                ("lgname", username.to_string()),
                ("lgpassword", password.to_string()),
                ("lgtoken", login_token),
            ],
            true,
        )?;
        let login_payload: LoginResponse =
            serde_json::from_value(login_response).context("failed to decode login response")?;
        match login_payload.login.result.as_deref() {
            Some("Success") => Ok(()),
            other => bail!(
                "MediaWiki login failed: {}",
                login_payload
                    .login
                    .reason
                    .or_else(|| other.map(ToString::to_string))
                    .unwrap_or_else(|| "unknown error".to_string())
            ),
        }
    }

    /// Submit an edit and hand back the raw payload; rejection is the caller's call.
    pub fn edit(&mut self, title: &str, text: &str, summary: &str, token: &str) -> Result<EditResponse> {
        let raw = self.send_post(
            &[
                ("action", "edit".to_string()),
                ("title", title.to_string()),
                ("text", text.to_string()),
                ("summary", summary.to_string()),
                ("bot", "1".to_string()),
                ("nocreate", "1".to_string()),
                ("token", token.to_string()),
            ],
            true,
        )?;
        Ok(edit_response_from_payload(raw))
    }

    fn request_json_get(&mut self, params: &[(&str, String)]) -> Result<Value> {
        let base_url = Url::parse(&self.config.api_url)
            .with_context(|| format!("invalid API URL: {}", self.config.api_url))?;
        let pairs = encode_params(params);

        for attempt in 0..=self.config.max_retries {
            self.apply_rate_limit(false);
            let response = self
                .client
                .get(base_url.clone())
                .header("User-Agent", self.config.user_agent.clone())
                .query(&pairs)
                .send();

            match response {
                Ok(response) => {
                    let status = response.status();
                    if !status.is_success() {
                        if attempt < self.config.max_retries && is_retryable_status(status) {
                            self.wait_before_retry(attempt);
                            continue;
                        }
                        bail!("MediaWiki API request failed with HTTP {status}");
                    }

                    let payload: Value = response
                        .json()
                        .context("failed to decode MediaWiki API JSON response")?;
                    ensure_no_api_error(&payload)?;
                    return Ok(payload);
                }
                Err(error) => {
                    if attempt < self.config.max_retries && is_retryable_error(&error) {
                        self.wait_before_retry(attempt);
                        continue;
                    }
                    return Err(error).context("failed to call MediaWiki API");
                }
            }
        }

        bail!("MediaWiki API request exhausted retry budget")
    }

    fn request_json_post(&mut self, params: &[(&str, String)], is_write: bool) -> Result<Value> {
        let payload = self.send_post(params, is_write)?;
        ensure_no_api_error(&payload)?;
        Ok(payload)
    }

    /// Writes are sent exactly once; a failed write aborts the run.
    fn send_post(&mut self, params: &[(&str, String)], is_write: bool) -> Result<Value> {
        let max_retries = if is_write { 0 } else { self.config.max_retries };
        let pairs = encode_params(params);

        for attempt in 0..=max_retries {
            self.apply_rate_limit(is_write);
            let response = self
                .client
                .post(&self.config.api_url)
                .header("User-Agent", self.config.user_agent.clone())
                .form(&pairs)
                .send();

            match response {
                Ok(response) => {
                    let status = response.status();
                    if !status.is_success() {
                        if attempt < max_retries && is_retryable_status(status) {
                            self.wait_before_retry(attempt);
                            continue;
                        }
                        bail!("MediaWiki API request failed with HTTP {status}");
                    }
                    return response
                        .json()
                        .context("failed to decode MediaWiki API JSON response");
                }
                Err(error) => {
                    if attempt < max_retries && is_retryable_error(&error) {
                        self.wait_before_retry(attempt);
                        continue;
                    }
                    return Err(error).context("failed to call MediaWiki API");
                }
            }
        }

        bail!("MediaWiki API request exhausted retry budget")
    }

    fn apply_rate_limit(&mut self, is_write: bool) {
        let delay = if is_write {
            Duration::from_millis(self.config.rate_limit_write_ms)
        } else {
            Duration::from_millis(self.config.rate_limit_read_ms)
        };
        if let Some(last) = self.last_request_at {
            let elapsed = last.elapsed();
            if elapsed < delay {
                sleep(delay - elapsed);
            }
        }
        self.last_request_at = Some(Instant::now());
        self.request_count += 1;
    }

    fn wait_before_retry(&self, attempt: usize) {
        let exponent = u32::try_from(attempt).unwrap_or(16);
        let base = self
            .config
            .retry_delay_ms
            .saturating_mul(2u64.saturating_pow(exponent));
        let jitter = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|duration| u64::from(duration.subsec_millis() % 100))
            .unwrap_or(0);
        tracing::debug!(attempt, "retrying MediaWiki request");
        sleep(Duration::from_millis(base.saturating_add(jitter)));
    }
}

/// A project's language editions, each reached through its own lazily built client.
pub struct ProjectClient {
    project: Project,
    user_agent: String,
    credentials: Option<Credentials>,
    clients: BTreeMap<String, MediaWikiClient>,
}

impl ProjectClient {
    pub fn new(project: Project, config: &BotConfig, credentials: Option<Credentials>) -> Self {
        Self {
            project,
            user_agent: config.user_agent(),
            credentials,
            clients: BTreeMap::new(),
        }
    }

    pub fn project(&self) -> &Project {
        &self.project
    }

    /// Open a session for `language`; requires bot credentials.
    pub fn login(&mut self, language: &str) -> Result<()> {
        if self.credentials.is_none() {
            bail!("WIKI_BOT_USER and WIKI_BOT_PASS are required to log in");
        }
        // a fresh client forces a new login handshake
        self.clients.remove(language);
        self.client_for(language).map(|_| ())
    }

    fn client_for(&mut self, language: &str) -> Result<&mut MediaWikiClient> {
        if !self.clients.contains_key(language) {
            let api_url = self.project.api_url(language)?;
            let mut client =
                MediaWikiClient::new(MediaWikiClientConfig::from_env(&api_url, &self.user_agent))?;
            if let Some(credentials) = &self.credentials {
                client
                    .login(&credentials.username, &credentials.password)
                    .with_context(|| format!("login failed for `{language}` ({api_url})"))?;
                tracing::info!(language, "logged in");
            }
            self.clients.insert(language.to_string(), client);
        }
        self.clients
            .get_mut(language)
            .ok_or_else(|| anyhow::anyhow!("no client for language `{language}`"))
    }
}

impl WikiApi for ProjectClient {
    fn list_titles(&mut self, language: &str, from: Option<&Checkpoint>) -> Result<TitleBatch> {
        self.client_for(language)?.all_pages(from)
    }

    fn get_lang_links(&mut self, language: &str, title: &str) -> Result<PageLookup> {
        tracing::debug!(language, title, "fetching language links");
        self.client_for(language)?.lang_links(title)
    }

    fn get_content(&mut self, language: &str, title: &str) -> Result<String> {
        self.client_for(language)?.content(title)
    }

    fn get_csrf_token(&mut self, language: &str) -> Result<String> {
        self.client_for(language)?.csrf_token()
    }

    fn edit(&mut self, request: &EditRequest<'_>) -> Result<EditResponse> {
        self.client_for(request.language)?.edit(
            request.title,
            request.text,
            request.summary,
            request.token,
        )
    }

    fn request_count(&self) -> usize {
        self.clients
            .values()
            .map(MediaWikiClient::request_count)
            .sum()
    }
}

fn encode_params(params: &[(&str, String)]) -> Vec<(String, String)> {
    let mut pairs = Vec::with_capacity(params.len() + 2);
    pairs.push(("format".to_string(), "json".to_string()));
    pairs.push(("formatversion".to_string(), "2".to_string()));
    for (key, value) in params {
        if !value.is_empty() {
            pairs.push(((*key).to_string(), value.clone()));
        }
    }
    pairs
}

fn ensure_no_api_error(payload: &Value) -> Result<()> {
    if let Some(error) = payload.get("error") {
        let code = error
            .get("code")
            .and_then(Value::as_str)
            .unwrap_or("unknown_error");
        let info = error
            .get("info")
            .and_then(Value::as_str)
            .unwrap_or("unknown info");
        bail!("MediaWiki API error [{code}]: {info}");
    }
    Ok(())
}

fn edit_response_from_payload(raw: Value) -> EditResponse {
    let result = raw
        .pointer("/edit/result")
        .and_then(Value::as_str)
        .map(ToString::to_string)
        .or_else(|| {
            raw.pointer("/error/code")
                .and_then(Value::as_str)
                .map(|code| format!("error:{code}"))
        });
    EditResponse { result, raw }
}

fn env_value_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

fn env_value_usize(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<usize>().ok())
        .unwrap_or(default)
}

fn is_retryable_status(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::REQUEST_TIMEOUT
            | StatusCode::TOO_MANY_REQUESTS
            | StatusCode::BAD_GATEWAY
            | StatusCode::SERVICE_UNAVAILABLE
            | StatusCode::GATEWAY_TIMEOUT
    )
}

fn is_retryable_error(error: &reqwest::Error) -> bool {
    error.is_timeout() || error.is_connect()
}

#[derive(Debug, Deserialize, Default)]
struct QueryResponse {
    #[serde(default)]
    query: QueryPayload,
    #[serde(default, rename = "continue")]
    continuation: Option<ContinuationPayload>,
}

#[derive(Debug, Deserialize, Default)]
struct QueryPayload {
    #[serde(default)]
    allpages: Vec<TitleQueryItem>,
    #[serde(default)]
    pages: Vec<PageQueryItem>,
}

#[derive(Debug, Deserialize, Default)]
struct ContinuationPayload {
    #[serde(rename = "continue")]
    continue_token: Option<String>,
    apcontinue: Option<String>,
    llcontinue: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TitleQueryItem {
    title: String,
}

#[derive(Debug, Deserialize)]
struct PageQueryItem {
    #[serde(default)]
    missing: bool,
    #[serde(default)]
    invalid: bool,
    #[serde(default)]
    langlinks: Vec<LangLinkItem>,
    #[serde(default)]
    revisions: Vec<RevisionQueryItem>,
}

#[derive(Debug, Deserialize)]
struct LangLinkItem {
    lang: String,
    title: String,
}

#[derive(Debug, Deserialize)]
struct RevisionQueryItem {
    slots: Option<RevisionSlotContainer>,
}

#[derive(Debug, Deserialize)]
struct RevisionSlotContainer {
    main: Option<RevisionMainSlot>,
}

#[derive(Debug, Deserialize)]
struct RevisionMainSlot {
    content: String,
}

#[derive(Debug, Deserialize, Default)]
struct TokenQueryResponse {
    #[serde(default)]
    query: TokenQueryPayload,
}

#[derive(Debug, Deserialize, Default)]
struct TokenQueryPayload {
    tokens: Option<TokenPayload>,
}

#[derive(Debug, Deserialize, Default)]
struct TokenPayload {
    logintoken: Option<String>,
    csrftoken: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct LoginResponse {
    #[serde(default)]
    login: LoginPayload,
}

#[derive(Debug, Deserialize, Default)]
struct LoginPayload {
    result: Option<String>,
    reason: Option<String>,
}
