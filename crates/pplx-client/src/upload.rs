//! Attachment upload wire types
//!
//! Uploading is a two-step flow. `create_upload_url` on the upstream returns
//! signed form fields; the file is then posted as multipart to Cloudinary
//! (images) or S3 (text). The resulting reference is only valid for the
//! session that requested the upload URL.

use rand::RngExt;
use reqwest::multipart::{Form, Part};
use serde::{Deserialize, Serialize};

use crate::constants::{PRIVATE_IMAGE_PREFIX, USER_UPLOADS_MARKER};
use crate::error::{Error, Result};

/// Source of an image attachment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Attachment {
    /// Base64 payload taken from a `data:` URL.
    Inline(String),
    /// URL fetched by the gateway before uploading.
    Remote(String),
}

/// Body of the `create_upload_url` call.
#[derive(Debug, Serialize)]
pub struct UploadUrlRequest<'a> {
    pub filename: &'a str,
    pub content_type: &'a str,
    pub source: &'static str,
    pub file_size: u64,
    pub force_image: bool,
}

impl<'a> UploadUrlRequest<'a> {
    pub fn new(filename: &'a str, content_type: &'a str) -> Self {
        Self {
            filename,
            content_type,
            source: "default",
            file_size: 12000,
            force_image: false,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct UploadUrlResponse {
    #[serde(default)]
    pub fields: UploadFields,
    #[serde(default)]
    pub rate_limited: bool,
}

/// Signed form fields. Cloudinary and S3 use disjoint subsets.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct UploadFields {
    pub timestamp: i64,
    pub unique_filename: String,
    pub folder: String,
    pub use_filename: String,
    pub public_id: String,
    pub transformation: String,
    pub moderation: String,
    pub resource_type: String,
    pub api_key: String,
    pub cloud_name: String,
    pub signature: String,
    #[serde(rename = "AWSAccessKeyId")]
    pub aws_access_key_id: String,
    pub key: String,
    pub tagging: String,
    pub policy: String,
    #[serde(rename = "x-amz-security-token")]
    pub amz_security_token: String,
    pub acl: String,
}

impl UploadFields {
    pub fn cloudinary_form(&self, filename: &str, data: Vec<u8>) -> Form {
        Form::new()
            .text("timestamp", self.timestamp.to_string())
            .text("unique_filename", self.unique_filename.clone())
            .text("folder", self.folder.clone())
            .text("use_filename", self.use_filename.clone())
            .text("public_id", self.public_id.clone())
            .text("transformation", self.transformation.clone())
            .text("moderation", self.moderation.clone())
            .text("resource_type", self.resource_type.clone())
            .text("api_key", self.api_key.clone())
            .text("cloud_name", self.cloud_name.clone())
            .text("signature", self.signature.clone())
            .text("type", "private")
            .part("file", Part::bytes(data).file_name(filename.to_string()))
    }

    pub fn s3_form(&self, filename: &str, data: Vec<u8>) -> Form {
        Form::new()
            .text("acl", self.acl.clone())
            .text("Content-Type", "text/plain")
            .text("tagging", self.tagging.clone())
            .text("key", self.key.clone())
            .text("AWSAccessKeyId", self.aws_access_key_id.clone())
            .text("x-amz-security-token", self.amz_security_token.clone())
            .text("policy", self.policy.clone())
            .text("signature", self.signature.clone())
            .part("file", Part::bytes(data).file_name(filename.to_string()))
    }
}

#[derive(Debug, Deserialize)]
pub struct CloudinaryResponse {
    #[serde(default)]
    pub secure_url: String,
}

/// Rewrite a Cloudinary `secure_url` to the private CDN form the upstream
/// accepts as an attachment.
pub fn private_image_url(secure_url: &str) -> Result<String> {
    let pos = secure_url.find(USER_UPLOADS_MARKER).ok_or_else(|| {
        Error::Upload(format!("unexpected image url from cloudinary: {secure_url}"))
    })?;
    Ok(format!("{PRIVATE_IMAGE_PREFIX}{}", &secure_url[pos..]))
}

const FILENAME_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// Random 5-character file name with the given extension.
pub fn random_filename(extension: &str) -> String {
    let mut bytes = [0u8; 5];
    rand::rng().fill(&mut bytes);
    let stem: String = bytes
        .iter()
        .map(|b| FILENAME_ALPHABET[*b as usize % FILENAME_ALPHABET.len()] as char)
        .collect();
    format!("{stem}.{extension}")
}
