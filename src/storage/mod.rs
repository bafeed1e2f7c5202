use std::time::Duration;

use aws_sdk_s3::Client;
use aws_sdk_s3::presigning::PresigningConfig;

use crate::config::AppConfig;

/// 署名付きURLの有効期限。
const PRESIGN_TTL: Duration = Duration::from_secs(15 * 60);

/// メディア参照（画像キー）を取得可能なURLへ解決する。
/// アップロードとリサイズは別サービスの責務で、この層はキーの保存と
/// 解決だけを行う。
#[derive(Debug, Clone)]
pub struct MediaStore {
    client: Client,
    bucket: String,
}

impl MediaStore {
    pub async fn new(config: &AppConfig) -> Self {
        let mut s3_config = aws_config::defaults(aws_config::BehaviorVersion::latest());
        if let Some(endpoint) = &config.s3_endpoint {
            s3_config = s3_config.endpoint_url(endpoint);
        }
        let sdk_config = s3_config
            .region(aws_config::Region::new(config.s3_region.clone()))
            .load()
            .await;

        let client = Client::new(&sdk_config);
        Self {
            client,
            bucket: config.s3_bucket.clone(),
        }
    }

    pub async fn url_for(&self, key: &str) -> Result<String, String> {
        let presigning = PresigningConfig::expires_in(PRESIGN_TTL).map_err(|e| e.to_string())?;
        let request = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .presigned(presigning)
            .await
            .map_err(|e| e.to_string())?;
        Ok(request.uri().to_string())
    }
}
