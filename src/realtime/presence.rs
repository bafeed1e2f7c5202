use std::collections::{HashMap, HashSet};

use tokio::sync::{RwLock, mpsc};

use super::ServerEvent;
use crate::types::{ConnectionId, ThreadId, UserId};

pub type EventSender = mpsc::UnboundedSender<ServerEvent>;

/// プロセス内の接続レジストリ兼ファンアウト層。
///
/// ユーザ単位のアドレス（そのユーザの全接続）とスレッド単位のアドレス
/// （joinした接続のみ）を持つ。ユーザは接続が1本以上あればオンライン、
/// 最後の接続が閉じた時点でオフラインになる。
///
/// ディスパッチャとゲートウェイには `AppState` 経由で注入される。
/// 複数プロセス構成にする場合はここを共有pub/sub実装に差し替える。
#[derive(Default)]
pub struct PresenceHub {
    inner: RwLock<HubInner>,
}

#[derive(Default)]
struct HubInner {
    connections: HashMap<ConnectionId, ConnectionEntry>,
    users: HashMap<UserId, HashSet<ConnectionId>>,
    threads: HashMap<ThreadId, HashSet<ConnectionId>>,
}

struct ConnectionEntry {
    user_id: UserId,
    tx: EventSender,
    joined: HashSet<ThreadId>,
}

impl PresenceHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// 接続を登録する。そのユーザの最初の接続なら true（Offline→Online）。
    pub async fn register(
        &self,
        user_id: &UserId,
        conn_id: &ConnectionId,
        tx: EventSender,
    ) -> bool {
        let mut inner = self.inner.write().await;
        inner.connections.insert(
            conn_id.clone(),
            ConnectionEntry {
                user_id: user_id.clone(),
                tx,
                joined: HashSet::new(),
            },
        );
        let conns = inner.users.entry(user_id.clone()).or_default();
        conns.insert(conn_id.clone());
        conns.len() == 1
    }

    /// 接続を解除する。そのユーザの最後の接続だったなら bool が true
    /// （Online→Offline）。未登録の接続なら None。
    pub async fn unregister(&self, conn_id: &ConnectionId) -> Option<(UserId, bool)> {
        let mut inner = self.inner.write().await;
        let entry = inner.connections.remove(conn_id)?;
        for thread_id in &entry.joined {
            if let Some(set) = inner.threads.get_mut(thread_id) {
                set.remove(conn_id);
                if set.is_empty() {
                    inner.threads.remove(thread_id);
                }
            }
        }
        let went_offline = match inner.users.get_mut(&entry.user_id) {
            Some(set) => {
                set.remove(conn_id);
                if set.is_empty() {
                    inner.users.remove(&entry.user_id);
                    true
                } else {
                    false
                }
            }
            None => true,
        };
        Some((entry.user_id, went_offline))
    }

    pub async fn join_thread(&self, conn_id: &ConnectionId, thread_id: &ThreadId) {
        let mut inner = self.inner.write().await;
        let Some(entry) = inner.connections.get_mut(conn_id) else {
            return;
        };
        entry.joined.insert(thread_id.clone());
        inner
            .threads
            .entry(thread_id.clone())
            .or_default()
            .insert(conn_id.clone());
    }

    pub async fn leave_thread(&self, conn_id: &ConnectionId, thread_id: &ThreadId) {
        let mut inner = self.inner.write().await;
        if let Some(entry) = inner.connections.get_mut(conn_id) {
            entry.joined.remove(thread_id);
        }
        if let Some(set) = inner.threads.get_mut(thread_id) {
            set.remove(conn_id);
            if set.is_empty() {
                inner.threads.remove(thread_id);
            }
        }
    }

    pub async fn is_online(&self, user_id: &UserId) -> bool {
        self.inner.read().await.users.contains_key(user_id)
    }

    /// ユーザの全接続（全デバイス）にイベントを送る。届いた接続数を返す。
    pub async fn send_to_user(&self, user_id: &UserId, event: &ServerEvent) -> usize {
        let inner = self.inner.read().await;
        let Some(conns) = inner.users.get(user_id) else {
            return 0;
        };
        let mut delivered = 0;
        for conn_id in conns {
            if let Some(entry) = inner.connections.get(conn_id)
                && entry.tx.send(event.clone()).is_ok()
            {
                delivered += 1;
            }
        }
        delivered
    }

    /// スレッドにjoin済みの接続へ送る（送信元の接続は除く）。
    /// 送信元自身がjoinしていないスレッドへは何も送らない。
    /// joinは参加者チェックを通るので、これがタイピング通知の認可になる。
    pub async fn send_to_thread(
        &self,
        from: &ConnectionId,
        thread_id: &ThreadId,
        event: &ServerEvent,
    ) -> usize {
        let inner = self.inner.read().await;
        let Some(conns) = inner.threads.get(thread_id) else {
            return 0;
        };
        if !conns.contains(from) {
            return 0;
        }
        let mut delivered = 0;
        for conn_id in conns {
            if conn_id == from {
                continue;
            }
            if let Some(entry) = inner.connections.get(conn_id)
                && entry.tx.send(event.clone()).is_ok()
            {
                delivered += 1;
            }
        }
        delivered
    }

    /// 全接続への一斉送信（presence変化の通知用）。
    pub async fn broadcast(&self, event: &ServerEvent) -> usize {
        let inner = self.inner.read().await;
        let mut delivered = 0;
        for entry in inner.connections.values() {
            if entry.tx.send(event.clone()).is_ok() {
                delivered += 1;
            }
        }
        delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::UserId;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn conn() -> (ConnectionId, EventSender, UnboundedReceiver<ServerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ConnectionId::new_v4(), tx, rx)
    }

    fn ping(thread: &str) -> ServerEvent {
        ServerEvent::Typing {
            thread_id: ThreadId(thread.into()),
            user_id: UserId("someone".into()),
            typing: true,
        }
    }

    #[tokio::test]
    async fn online_edges_fire_on_first_and_last_connection() {
        let hub = PresenceHub::new();
        let alice = UserId("alice".into());
        let (c1, tx1, _rx1) = conn();
        let (c2, tx2, _rx2) = conn();

        // 1本目でオンライン、2本目（マルチデバイス）では遷移しない
        assert!(hub.register(&alice, &c1, tx1).await);
        assert!(!hub.register(&alice, &c2, tx2).await);
        assert!(hub.is_online(&alice).await);

        // 1本閉じてもまだオンライン、最後の1本でオフライン
        assert_eq!(hub.unregister(&c1).await, Some((alice.clone(), false)));
        assert!(hub.is_online(&alice).await);
        assert_eq!(hub.unregister(&c2).await, Some((alice.clone(), true)));
        assert!(!hub.is_online(&alice).await);

        // 未登録接続の解除は no-op
        assert_eq!(hub.unregister(&c1).await, None);
    }

    #[tokio::test]
    async fn send_to_user_reaches_every_device() {
        let hub = PresenceHub::new();
        let alice = UserId("alice".into());
        let (c1, tx1, mut rx1) = conn();
        let (c2, tx2, mut rx2) = conn();
        hub.register(&alice, &c1, tx1).await;
        hub.register(&alice, &c2, tx2).await;

        let delivered = hub.send_to_user(&alice, &ping("t1")).await;
        assert_eq!(delivered, 2);
        assert!(rx1.try_recv().is_ok());
        assert!(rx2.try_recv().is_ok());

        let nobody = UserId("nobody".into());
        assert_eq!(hub.send_to_user(&nobody, &ping("t1")).await, 0);
    }

    #[tokio::test]
    async fn thread_fanout_excludes_sender_and_requires_join() {
        let hub = PresenceHub::new();
        let alice = UserId("alice".into());
        let bob = UserId("bob".into());
        let thread = ThreadId("t1".into());

        let (ca, txa, mut rxa) = conn();
        let (cb, txb, mut rxb) = conn();
        hub.register(&alice, &ca, txa).await;
        hub.register(&bob, &cb, txb).await;

        // join前の送信は捨てられる
        assert_eq!(hub.send_to_thread(&ca, &thread, &ping("t1")).await, 0);

        hub.join_thread(&ca, &thread).await;
        hub.join_thread(&cb, &thread).await;

        let delivered = hub.send_to_thread(&ca, &thread, &ping("t1")).await;
        assert_eq!(delivered, 1);
        // 送信元自身には届かない
        assert!(rxa.try_recv().is_err());
        assert!(rxb.try_recv().is_ok());

        // leave後は届かない
        hub.leave_thread(&cb, &thread).await;
        assert_eq!(hub.send_to_thread(&ca, &thread, &ping("t1")).await, 0);
    }

    #[tokio::test]
    async fn unregister_cleans_thread_subscriptions() {
        let hub = PresenceHub::new();
        let alice = UserId("alice".into());
        let bob = UserId("bob".into());
        let thread = ThreadId("t1".into());

        let (ca, txa, _rxa) = conn();
        let (cb, txb, mut rxb) = conn();
        hub.register(&alice, &ca, txa).await;
        hub.register(&bob, &cb, txb).await;
        hub.join_thread(&ca, &thread).await;
        hub.join_thread(&cb, &thread).await;

        hub.unregister(&ca).await;
        // 切断済み接続からの送信は無効
        assert_eq!(hub.send_to_thread(&ca, &thread, &ping("t1")).await, 0);
        assert!(rxb.try_recv().is_err());
    }
}
