use serde::{Deserialize, Serialize};

/// SQLite では TEXT として格納されるため String、
/// PostgreSQL では TIMESTAMPTZ として格納されるため chrono 型を使用。
#[cfg(not(feature = "postgres"))]
pub type Timestamp = String;
#[cfg(feature = "postgres")]
pub type Timestamp = chrono::DateTime<chrono::Utc>;

/// 格納形式の時刻を chrono に戻す。SQLite の文字列はRFC 3339として読める。
#[cfg(not(feature = "postgres"))]
pub fn timestamp_to_datetime(t: &Timestamp) -> Option<chrono::DateTime<chrono::Utc>> {
    chrono::DateTime::parse_from_rfc3339(t)
        .ok()
        .map(|d| d.with_timezone(&chrono::Utc))
}

#[cfg(feature = "postgres")]
pub fn timestamp_to_datetime(t: &Timestamp) -> Option<chrono::DateTime<chrono::Utc>> {
    Some(*t)
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct UserRow {
    pub id: String,
    pub display_name: String,
    pub avatar_key: Option<String>,
    pub is_active: bool,
    pub is_online: bool,
    pub last_seen: Option<Timestamp>,
    #[serde(skip_serializing)]
    pub password_changed_at: Option<Timestamp>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct ThreadRow {
    pub id: String,
    #[serde(skip_serializing)]
    pub pair_key: String,
    pub listing_id: Option<String>,
    pub last_message_text: Option<String>,
    pub last_message_image_key: Option<String>,
    pub last_message_sender_id: Option<String>,
    pub last_message_at: Option<Timestamp>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct ThreadParticipantRow {
    pub thread_id: String,
    pub user_id: String,
    pub unread_count: i64,
    pub archived: bool,
    pub locally_deleted_at: Option<Timestamp>,
}

/// スレッド一覧・イベント通知用の集約行。
/// 閲覧者自身の未読数と、相手参加者の表示情報をJOINで引いてくる。
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct ThreadSummaryRow {
    pub id: String,
    pub listing_id: Option<String>,
    pub unread_count: i64,
    pub archived: bool,
    pub peer_id: String,
    pub peer_display_name: Option<String>,
    pub peer_is_online: Option<bool>,
    pub peer_last_seen: Option<Timestamp>,
    pub last_message_text: Option<String>,
    pub last_message_image_key: Option<String>,
    pub last_message_sender_id: Option<String>,
    pub last_message_at: Option<Timestamp>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct MessageRow {
    pub id: String,
    pub thread_id: String,
    pub sender_id: String,
    pub kind: String,
    pub text: Option<String>,
    pub image_key: Option<String>,
    pub metadata: Option<sqlx::types::Json<serde_json::Value>>,
    pub status: String,
    pub deleted_globally: bool,
    pub reported: bool,
    pub created_at: Timestamp,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct PushSubscriptionRow {
    pub id: String,
    pub user_id: String,
    pub endpoint: String,
    pub p256dh: String,
    pub auth: String,
    pub created_at: Timestamp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryStatus {
    Sent,
    Delivered,
    Read,
}

impl DeliveryStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sent => "sent",
            Self::Delivered => "delivered",
            Self::Read => "read",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OfferStatus {
    Pending,
    Accepted,
    Declined,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppointmentStatus {
    Pending,
    Confirmed,
    Cancelled,
}

/// メッセージ本文。リクエストボディとイベントチャネルの両方で使う。
/// `text`/`image` は単純な本文、`offer`/`appointment` は型付きメタデータを持つ。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageContent {
    Text {
        text: String,
    },
    Image {
        image_key: String,
    },
    Offer {
        amount: f64,
        currency: String,
        status: OfferStatus,
    },
    Appointment {
        date: String,
        location: String,
        status: AppointmentStatus,
    },
    System {
        text: String,
    },
}

impl MessageContent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Text { .. } => "text",
            Self::Image { .. } => "image",
            Self::Offer { .. } => "offer",
            Self::Appointment { .. } => "appointment",
            Self::System { .. } => "system",
        }
    }

    /// 本文の形状を検証する。不正な場合は理由を返す。
    pub fn validate(&self) -> Result<(), String> {
        match self {
            Self::Text { text } | Self::System { text } => {
                if text.trim().is_empty() {
                    return Err("message body must not be empty".into());
                }
            }
            Self::Image { image_key } => {
                if image_key.trim().is_empty() {
                    return Err("image reference must not be empty".into());
                }
            }
            Self::Offer {
                amount, currency, ..
            } => {
                if !amount.is_finite() || *amount <= 0.0 {
                    return Err("offer amount must be a positive number".into());
                }
                if currency.trim().is_empty() {
                    return Err("offer currency must not be empty".into());
                }
            }
            Self::Appointment { date, location, .. } => {
                if chrono::DateTime::parse_from_rfc3339(date).is_err() {
                    return Err("appointment date must be an RFC 3339 timestamp".into());
                }
                if location.trim().is_empty() {
                    return Err("appointment location must not be empty".into());
                }
            }
        }
        Ok(())
    }

    pub fn text(&self) -> Option<&str> {
        match self {
            Self::Text { text } | Self::System { text } => Some(text),
            _ => None,
        }
    }

    pub fn image_key(&self) -> Option<&str> {
        match self {
            Self::Image { image_key } => Some(image_key),
            _ => None,
        }
    }

    /// `offer`/`appointment` の型付きペイロードをJSONとして返す。
    pub fn metadata(&self) -> Option<serde_json::Value> {
        match self {
            Self::Offer {
                amount,
                currency,
                status,
            } => Some(serde_json::json!({
                "amount": amount,
                "currency": currency,
                "status": status,
            })),
            Self::Appointment {
                date,
                location,
                status,
            } => Some(serde_json::json!({
                "date": date,
                "location": location,
                "status": status,
            })),
            _ => None,
        }
    }
}
