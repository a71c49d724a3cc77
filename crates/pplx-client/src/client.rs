//! HTTP implementation of the upstream operations

use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use futures_util::StreamExt;
use reqwest::StatusCode;
use reqwest::header::{ACCEPT, COOKIE, HeaderMap, HeaderName, HeaderValue, SET_COOKIE};
use session_pool::{Session, SessionRefresher};
use tracing::{debug, info, warn};

use crate::ask::{AskRequest, Query};
use crate::constants::{
    ASK_PATH, COMMON_HEADERS, DEFAULT_BASE_URL, DEFAULT_CLOUDINARY_URL, DEFAULT_S3_URL,
    SESSION_COOKIE, SESSION_PATH, UPLOAD_URL_PATH,
};
use crate::error::{Error, Result};
use crate::upload::{
    Attachment, CloudinaryResponse, UploadFields, UploadUrlRequest, UploadUrlResponse,
    private_image_url, random_filename,
};
use crate::{BoxFuture, EventBody, Upstream};

/// Endpoints, proxy and timeouts for the upstream client.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub base_url: String,
    pub cloudinary_url: String,
    pub s3_url: String,
    pub proxy: Option<String>,
    pub connect_timeout: Duration,
    /// Whole-request deadline, including reading a streamed answer.
    pub request_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.into(),
            cloudinary_url: DEFAULT_CLOUDINARY_URL.into(),
            s3_url: DEFAULT_S3_URL.into(),
            proxy: None,
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(600),
        }
    }
}

/// Shared upstream client. One instance serves every session; the session
/// cookie is attached per call.
pub struct PplxClient {
    http: reqwest::Client,
    config: ClientConfig,
}

impl PplxClient {
    pub fn new(config: ClientConfig) -> Result<Self> {
        let mut headers = HeaderMap::new();
        for &(name, value) in COMMON_HEADERS {
            headers.insert(HeaderName::from_static(name), HeaderValue::from_static(value));
        }

        let mut builder = reqwest::Client::builder()
            .default_headers(headers)
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout);

        if let Some(proxy) = config.proxy.as_deref() {
            let proxy = reqwest::Proxy::all(proxy)
                .map_err(|e| Error::Http(format!("invalid proxy {proxy}: {e}")))?;
            builder = builder.proxy(proxy);
        }

        let http = builder
            .build()
            .map_err(|e| Error::Http(format!("building HTTP client: {e}")))?;

        Ok(Self { http, config })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    async fn post_ask(&self, session: &Session, query: &Query) -> Result<EventBody> {
        let request = AskRequest::new(query);
        debug!(
            model = %query.model,
            search = query.search,
            attachments = query.attachments.len(),
            prompt_bytes = query.prompt.len(),
            "sending ask request"
        );

        let response = self
            .http
            .post(self.url(ASK_PATH))
            .header(COOKIE, session_cookie(session))
            .header(ACCEPT, "text/event-stream")
            .json(&request)
            .send()
            .await
            .map_err(|e| Error::Http(format!("ask request failed: {e}")))?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(Error::RateLimited);
        }
        if status != StatusCode::OK {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| String::from("<no body>"));
            return Err(Error::Status {
                status: status.as_u16(),
                body,
            });
        }

        Ok(Box::pin(response.bytes_stream().map(|chunk| {
            chunk.map_err(|e| Error::Http(format!("reading ask response: {e}")))
        })))
    }

    async fn create_upload_url(
        &self,
        session: &Session,
        filename: &str,
        content_type: &str,
    ) -> Result<UploadFields> {
        let response = self
            .http
            .post(self.url(UPLOAD_URL_PATH))
            .header(COOKIE, session_cookie(session))
            .json(&UploadUrlRequest::new(filename, content_type))
            .send()
            .await
            .map_err(|e| Error::Http(format!("create upload url failed: {e}")))?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(Error::RateLimited);
        }
        if status != StatusCode::OK {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| String::from("<no body>"));
            return Err(Error::Upload(format!(
                "create upload url returned {status}: {body}"
            )));
        }

        let parsed: UploadUrlResponse = response
            .json()
            .await
            .map_err(|e| Error::Upload(format!("invalid upload url response: {e}")))?;
        if parsed.rate_limited {
            warn!("upload url request rate limited");
            return Err(Error::RateLimited);
        }
        Ok(parsed.fields)
    }

    async fn image_bytes(&self, image: &Attachment) -> Result<Vec<u8>> {
        match image {
            Attachment::Inline(data) => STANDARD
                .decode(data.trim())
                .map_err(|e| Error::Upload(format!("invalid base64 image: {e}"))),
            Attachment::Remote(url) => {
                let response = self
                    .http
                    .get(url)
                    .send()
                    .await
                    .map_err(|e| Error::Upload(format!("fetching image {url}: {e}")))?;
                if !response.status().is_success() {
                    return Err(Error::Upload(format!(
                        "fetching image {url} returned {}",
                        response.status()
                    )));
                }
                let bytes = response
                    .bytes()
                    .await
                    .map_err(|e| Error::Upload(format!("reading image {url}: {e}")))?;
                Ok(bytes.to_vec())
            }
        }
    }

    async fn post_image(&self, session: &Session, image: &Attachment) -> Result<String> {
        let data = self.image_bytes(image).await?;
        let filename = random_filename("jpg");
        let fields = self
            .create_upload_url(session, &filename, "image/jpeg")
            .await?;

        let url = format!(
            "{}/{}/image/upload",
            self.config.cloudinary_url.trim_end_matches('/'),
            fields.cloud_name
        );
        let response = self
            .http
            .post(url)
            .multipart(fields.cloudinary_form(&filename, data))
            .send()
            .await
            .map_err(|e| Error::Upload(format!("image upload failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::Upload(format!("image upload returned {status}")));
        }
        let uploaded: CloudinaryResponse = response
            .json()
            .await
            .map_err(|e| Error::Upload(format!("invalid image upload response: {e}")))?;

        let reference = private_image_url(&uploaded.secure_url)?;
        info!(filename = %filename, "image uploaded");
        Ok(reference)
    }

    async fn post_text(&self, session: &Session, text: &str) -> Result<String> {
        let filename = random_filename("txt");
        let fields = self
            .create_upload_url(session, &filename, "text/plain")
            .await?;

        let response = self
            .http
            .post(&self.config.s3_url)
            .multipart(fields.s3_form(&filename, text.as_bytes().to_vec()))
            .send()
            .await
            .map_err(|e| Error::Upload(format!("text upload failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::Upload(format!("text upload returned {status}")));
        }

        info!(filename = %filename, bytes = text.len(), "text uploaded");
        Ok(format!("{}{}", self.config.s3_url, fields.key))
    }

    async fn renew(&self, session: &Session) -> session_pool::Result<Session> {
        let response = self
            .http
            .get(self.url(SESSION_PATH))
            .header(COOKIE, session_cookie(session))
            .send()
            .await
            .map_err(|e| session_pool::Error::RefreshFailed(format!("session request failed: {e}")))?;

        let status = response.status();
        if status != StatusCode::OK {
            return Err(session_pool::Error::RefreshFailed(format!(
                "session endpoint returned {status}"
            )));
        }

        find_session_cookie(response.headers())
            .map(Session::new)
            .ok_or_else(|| session_pool::Error::RefreshFailed("session cookie not found".into()))
    }
}

impl Upstream for PplxClient {
    fn ask<'a>(&'a self, session: &'a Session, query: &'a Query) -> BoxFuture<'a, Result<EventBody>> {
        Box::pin(self.post_ask(session, query))
    }

    fn upload_image<'a>(
        &'a self,
        session: &'a Session,
        image: &'a Attachment,
    ) -> BoxFuture<'a, Result<String>> {
        Box::pin(self.post_image(session, image))
    }

    fn upload_text<'a>(&'a self, session: &'a Session, text: &'a str) -> BoxFuture<'a, Result<String>> {
        Box::pin(self.post_text(session, text))
    }
}

impl SessionRefresher for PplxClient {
    fn refresh<'a>(&'a self, session: &'a Session) -> BoxFuture<'a, session_pool::Result<Session>> {
        Box::pin(self.renew(session))
    }
}

fn session_cookie(session: &Session) -> String {
    format!("{SESSION_COOKIE}={}", session.token())
}

/// Value of the session cookie in the `Set-Cookie` headers, if renewed.
fn find_session_cookie(headers: &HeaderMap) -> Option<String> {
    headers
        .get_all(SET_COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .filter_map(|cookie| cookie.split(';').next())
        .filter_map(|pair| pair.split_once('='))
        .find(|(name, value)| name.trim() == SESSION_COOKIE && !value.is_empty())
        .map(|(_, value)| value.trim().to_string())
}
