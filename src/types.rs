use serde::{Deserialize, Serialize};

macro_rules! newtype_id {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new_v4() -> Self {
                Self(uuid::Uuid::new_v4().to_string())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }
    };
}

newtype_id!(UserId);
newtype_id!(ThreadId);
newtype_id!(MessageId);
newtype_id!(ListingId);
newtype_id!(ConnectionId);
newtype_id!(SubscriptionId);

impl ThreadId {
    /// 参加者ペア（＋任意のリスティング）から正規化された一意キーを生成する。
    /// ユーザIDを辞書順に並べるため、どちら側から作成しても同じキーになる。
    pub fn pair_key(a: &UserId, b: &UserId, listing: Option<&ListingId>) -> String {
        let (low, high) = if a.as_str() <= b.as_str() {
            (a.as_str(), b.as_str())
        } else {
            (b.as_str(), a.as_str())
        };
        match listing {
            Some(l) => format!("{low}#{high}#{l}"),
            None => format!("{low}#{high}#"),
        }
    }
}
