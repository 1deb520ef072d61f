//! Post-download processing: optional encryption, then optional cloud upload
//!
//! Both steps run after the download is already `completed`. A failing step
//! is logged and reported in the outcome, it never fails the download.

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

use cipher::block_padding::Pkcs7;
use cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};

use crate::core::config::PostProcessConfig;
use crate::core::error_handling::{EncryptionError, UploadError};

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;
type HmacSha256 = Hmac<Sha256>;

const IV_LEN: usize = 16;
const TAG_LEN: usize = 32;
const ENCRYPTED_SUFFIX: &str = ".enc";

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EncryptionMethod {
    /// Key is the SHA-256 digest of a password
    #[default]
    Password,
    /// Key is 32 raw bytes given as hex
    Key,
}

impl EncryptionMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Password => "password",
            Self::Key => "key",
        }
    }
}

impl fmt::Display for EncryptionMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EncryptionMethod {
    type Err = EncryptionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "password" => Ok(Self::Password),
            "key" => Ok(Self::Key),
            other => Err(EncryptionError::UnsupportedMethod(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum CloudProvider {
    #[serde(rename = "google-drive")]
    GoogleDrive,
    #[serde(rename = "dropbox")]
    Dropbox,
    #[serde(rename = "onedrive")]
    OneDrive,
}

impl CloudProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::GoogleDrive => "google-drive",
            Self::Dropbox => "dropbox",
            Self::OneDrive => "onedrive",
        }
    }
}

impl fmt::Display for CloudProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloudCredentials {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
}

#[async_trait]
pub trait Encryptor: Send + Sync {
    /// Encrypt `file_path` and return the path of the encrypted file
    async fn encrypt(
        &self,
        file_path: &Path,
        method: EncryptionMethod,
        key: &str,
    ) -> Result<PathBuf, EncryptionError>;
}

#[async_trait]
pub trait CloudUploader: Send + Sync {
    /// Upload `file_path` and return a remote locator
    async fn upload(
        &self,
        file_path: &Path,
        provider: CloudProvider,
        credentials: &CloudCredentials,
    ) -> Result<String, UploadError>;
}

/// AES-256-CBC with PKCS7 padding, authenticated with HMAC-SHA256
/// (encrypt-then-MAC). Output is `<file>.enc` holding a random 16-byte IV,
/// the ciphertext and a 32-byte tag over both. Cipher and MAC keys are
/// derived separately from the 32-byte key.
#[derive(Debug, Clone, Default)]
pub struct AesFileEncryptor;

impl AesFileEncryptor {
    pub fn new() -> Self {
        Self
    }

    pub fn derive_key(method: EncryptionMethod, key: &str) -> Result<[u8; 32], EncryptionError> {
        match method {
            EncryptionMethod::Password => {
                let digest = Sha256::digest(key.as_bytes());
                let mut derived = [0u8; 32];
                derived.copy_from_slice(&digest);
                Ok(derived)
            }
            EncryptionMethod::Key => {
                let bytes = hex::decode(key.trim())
                    .map_err(|e| EncryptionError::InvalidKey(e.to_string()))?;
                <[u8; 32]>::try_from(bytes.as_slice()).map_err(|_| {
                    EncryptionError::InvalidKey(format!(
                        "expected 32 bytes, got {}",
                        bytes.len()
                    ))
                })
            }
        }
    }

    fn subkey(key: &[u8; 32], label: &[u8]) -> Result<[u8; 32], EncryptionError> {
        let mut mac = HmacSha256::new_from_slice(key)
            .map_err(|e| EncryptionError::Cipher(e.to_string()))?;
        mac.update(label);
        let mut subkey = [0u8; 32];
        subkey.copy_from_slice(&mac.finalize().into_bytes());
        Ok(subkey)
    }

    fn tag_mac(key: &[u8; 32], iv: &[u8], ciphertext: &[u8]) -> Result<HmacSha256, EncryptionError> {
        let mac_key = Self::subkey(key, b"segment-dl/mac")?;
        let mut mac = HmacSha256::new_from_slice(&mac_key)
            .map_err(|e| EncryptionError::Cipher(e.to_string()))?;
        mac.update(iv);
        mac.update(ciphertext);
        Ok(mac)
    }

    pub fn encrypt_bytes(key: &[u8; 32], plaintext: &[u8]) -> Result<Vec<u8>, EncryptionError> {
        let iv: [u8; IV_LEN] = rand::random();
        let enc_key = Self::subkey(key, b"segment-dl/enc")?;
        let cipher = Aes256CbcEnc::new_from_slices(&enc_key, &iv)
            .map_err(|e| EncryptionError::Cipher(e.to_string()))?;

        let ciphertext = cipher.encrypt_padded_vec_mut::<Pkcs7>(plaintext);
        let tag = Self::tag_mac(key, &iv, &ciphertext)?.finalize().into_bytes();

        let mut output = Vec::with_capacity(IV_LEN + ciphertext.len() + TAG_LEN);
        output.extend_from_slice(&iv);
        output.extend_from_slice(&ciphertext);
        output.extend_from_slice(&tag);
        Ok(output)
    }

    /// Fails with `Authentication` before decrypting anything if the tag
    /// does not match
    pub fn decrypt_bytes(key: &[u8; 32], data: &[u8]) -> Result<Vec<u8>, EncryptionError> {
        if data.len() < IV_LEN + TAG_LEN {
            return Err(EncryptionError::Cipher(
                "input shorter than IV and tag".to_string(),
            ));
        }

        let (iv, rest) = data.split_at(IV_LEN);
        let (ciphertext, tag) = rest.split_at(rest.len() - TAG_LEN);
        Self::tag_mac(key, iv, ciphertext)?
            .verify_slice(tag)
            .map_err(|_| EncryptionError::Authentication)?;

        let enc_key = Self::subkey(key, b"segment-dl/enc")?;
        let cipher = Aes256CbcDec::new_from_slices(&enc_key, iv)
            .map_err(|e| EncryptionError::Cipher(e.to_string()))?;

        cipher
            .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
            .map_err(|e| EncryptionError::Cipher(e.to_string()))
    }

    /// Decrypt a `.enc` file next to itself. The encrypted file is kept.
    pub async fn decrypt(
        &self,
        file_path: &Path,
        method: EncryptionMethod,
        key: &str,
    ) -> Result<PathBuf, EncryptionError> {
        let name = file_path.to_string_lossy();
        let Some(plain_name) = name.strip_suffix(ENCRYPTED_SUFFIX) else {
            return Err(EncryptionError::NotEncrypted(file_path.to_path_buf()));
        };
        let output_path = PathBuf::from(plain_name);

        let key = Self::derive_key(method, key)?;
        let data = tokio::fs::read(file_path).await?;
        let plaintext = tokio::task::spawn_blocking(move || Self::decrypt_bytes(&key, &data))
            .await
            .map_err(|e| EncryptionError::Cipher(e.to_string()))??;

        tokio::fs::write(&output_path, plaintext).await?;
        Ok(output_path)
    }
}

#[async_trait]
impl Encryptor for AesFileEncryptor {
    async fn encrypt(
        &self,
        file_path: &Path,
        method: EncryptionMethod,
        key: &str,
    ) -> Result<PathBuf, EncryptionError> {
        let key = Self::derive_key(method, key)?;

        let mut output_name = file_path.as_os_str().to_owned();
        output_name.push(ENCRYPTED_SUFFIX);
        let output_path = PathBuf::from(output_name);

        let data = tokio::fs::read(file_path).await?;
        let encrypted = tokio::task::spawn_blocking(move || Self::encrypt_bytes(&key, &data))
            .await
            .map_err(|e| EncryptionError::Cipher(e.to_string()))??;

        tokio::fs::write(&output_path, encrypted).await?;
        tokio::fs::remove_file(file_path).await?;

        Ok(output_path)
    }
}

/// API base URLs, overridable for self-hosted gateways and tests
#[derive(Debug, Clone)]
pub struct CloudEndpoints {
    pub google_drive: String,
    pub dropbox: String,
    pub onedrive: String,
}

impl Default for CloudEndpoints {
    fn default() -> Self {
        Self {
            google_drive: "https://www.googleapis.com".to_string(),
            dropbox: "https://content.dropboxapi.com".to_string(),
            onedrive: "https://graph.microsoft.com".to_string(),
        }
    }
}

impl CloudEndpoints {
    /// Every provider served from one base URL
    pub fn uniform(base: &str) -> Self {
        let base = base.trim_end_matches('/').to_string();
        Self {
            google_drive: base.clone(),
            dropbox: base.clone(),
            onedrive: base,
        }
    }
}

/// Uploads through each provider's plain HTTP API with a bearer token
#[derive(Debug, Clone)]
pub struct HttpCloudUploader {
    client: Client,
    endpoints: CloudEndpoints,
}

impl HttpCloudUploader {
    pub fn new(client: Client) -> Self {
        Self::with_endpoints(client, CloudEndpoints::default())
    }

    pub fn with_endpoints(client: Client, endpoints: CloudEndpoints) -> Self {
        Self { client, endpoints }
    }

    async fn upload_google_drive(
        &self,
        data: Vec<u8>,
        credentials: &CloudCredentials,
    ) -> Result<String, UploadError> {
        let url = format!(
            "{}/upload/drive/v3/files?uploadType=media",
            self.endpoints.google_drive
        );
        let response = self
            .client
            .post(url)
            .header(AUTHORIZATION, format!("Bearer {}", credentials.access_token))
            .header(CONTENT_TYPE, "application/octet-stream")
            .body(data)
            .send()
            .await?;

        let body = json_body(response).await?;
        let id = body
            .get("id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| UploadError::InvalidResponse("missing file id".to_string()))?;

        Ok(format!("https://drive.google.com/file/d/{}/view", id))
    }

    async fn upload_dropbox(
        &self,
        file_name: &str,
        data: Vec<u8>,
        credentials: &CloudCredentials,
    ) -> Result<String, UploadError> {
        let url = format!("{}/2/files/upload", self.endpoints.dropbox);
        let api_arg = serde_json::json!({
            "path": format!("/{}", file_name),
            "mode": "add",
            "autorename": true,
        });

        let response = self
            .client
            .post(url)
            .header(AUTHORIZATION, format!("Bearer {}", credentials.access_token))
            .header(CONTENT_TYPE, "application/octet-stream")
            .header("Dropbox-API-Arg", api_arg.to_string())
            .body(data)
            .send()
            .await?;

        let body = json_body(response).await?;
        body.get("path_display")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or_else(|| UploadError::InvalidResponse("missing path_display".to_string()))
    }

    async fn upload_onedrive(
        &self,
        file_name: &str,
        data: Vec<u8>,
        credentials: &CloudCredentials,
    ) -> Result<String, UploadError> {
        let mut url = url::Url::parse(&self.endpoints.onedrive)
            .map_err(|e| UploadError::InvalidResponse(format!("bad endpoint: {}", e)))?;
        url.path_segments_mut()
            .map_err(|_| UploadError::InvalidResponse("endpoint cannot be a base".to_string()))?
            .pop_if_empty()
            .extend(["v1.0", "me", "drive", "root:"])
            .push(&format!("{}:", file_name))
            .push("content");

        let response = self
            .client
            .put(url)
            .header(AUTHORIZATION, format!("Bearer {}", credentials.access_token))
            .header(CONTENT_TYPE, "application/octet-stream")
            .body(data)
            .send()
            .await?;

        let body = json_body(response).await?;
        body.get("webUrl")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or_else(|| UploadError::InvalidResponse("missing webUrl".to_string()))
    }
}

async fn json_body(response: reqwest::Response) -> Result<serde_json::Value, UploadError> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(UploadError::Rejected {
            status: status.as_u16(),
            body,
        });
    }

    response
        .json::<serde_json::Value>()
        .await
        .map_err(|e| UploadError::InvalidResponse(e.to_string()))
}

#[async_trait]
impl CloudUploader for HttpCloudUploader {
    async fn upload(
        &self,
        file_path: &Path,
        provider: CloudProvider,
        credentials: &CloudCredentials,
    ) -> Result<String, UploadError> {
        if credentials.access_token.is_empty() {
            return Err(UploadError::MissingCredentials(provider.to_string()));
        }

        let file_name = file_path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "download".to_string());
        let data = tokio::fs::read(file_path).await?;

        info!("☁️ Uploading {} to {}", file_name, provider);

        match provider {
            CloudProvider::GoogleDrive => self.upload_google_drive(data, credentials).await,
            CloudProvider::Dropbox => self.upload_dropbox(&file_name, data, credentials).await,
            CloudProvider::OneDrive => self.upload_onedrive(&file_name, data, credentials).await,
        }
    }
}

/// What post-processing did to a completed download
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PostProcessOutcome {
    /// Where the file ended up, set only when it moved
    pub file_path: Option<PathBuf>,
    pub encryption_method: Option<EncryptionMethod>,
    pub cloud_path: Option<String>,
    /// Human readable failures, one per failed step
    pub failures: Vec<String>,
}

impl PostProcessOutcome {
    pub fn encrypted(&self) -> bool {
        self.encryption_method.is_some()
    }
}

/// Runs the configured steps in order: encrypt, then upload
#[derive(Clone)]
pub struct PostProcessor {
    settings: PostProcessConfig,
    encryptor: Arc<dyn Encryptor>,
    uploader: Arc<dyn CloudUploader>,
}

impl PostProcessor {
    pub fn new(
        settings: PostProcessConfig,
        encryptor: Arc<dyn Encryptor>,
        uploader: Arc<dyn CloudUploader>,
    ) -> Self {
        Self {
            settings,
            encryptor,
            uploader,
        }
    }

    /// AES encryption and plain HTTP uploads
    pub fn with_defaults(settings: PostProcessConfig, client: Client) -> Self {
        Self::new(
            settings,
            Arc::new(AesFileEncryptor::new()),
            Arc::new(HttpCloudUploader::new(client)),
        )
    }

    pub fn is_enabled(&self) -> bool {
        self.settings.encryption.is_some() || self.settings.cloud_sync.is_some()
    }

    pub async fn run(&self, download_id: &str, file_path: &Path) -> PostProcessOutcome {
        let mut outcome = PostProcessOutcome::default();
        let mut current = file_path.to_path_buf();

        if let Some(ref encryption) = self.settings.encryption {
            match self
                .encryptor
                .encrypt(&current, encryption.method, &encryption.key)
                .await
            {
                Ok(encrypted_path) => {
                    info!("🔒 Encrypted {} -> {:?}", download_id, encrypted_path);
                    current = encrypted_path.clone();
                    outcome.file_path = Some(encrypted_path);
                    outcome.encryption_method = Some(encryption.method);
                }
                Err(e) => {
                    warn!("Encryption failed for {}: {}", download_id, e);
                    outcome.failures.push(format!("encryption: {}", e));
                }
            }
        }

        if let Some(ref cloud) = self.settings.cloud_sync {
            match self
                .uploader
                .upload(&current, cloud.provider, &cloud.credentials)
                .await
            {
                Ok(locator) => {
                    info!("✅ Uploaded {} to {}: {}", download_id, cloud.provider, locator);
                    outcome.cloud_path = Some(locator);
                }
                Err(e) => {
                    warn!("Cloud upload failed for {}: {}", download_id, e);
                    outcome.failures.push(format!("cloud upload: {}", e));
                }
            }
        }

        outcome
    }
}
