//! Delivery of chat lines to registered sessions.
//!
//! Writes always go to copies taken from the registry, never while the
//! registry lock is held. A write that fails does not abort the delivery:
//! the failing session is collected and asked to close only after every
//! other recipient has been served.

use std::sync::Arc;

use tracing::{debug, info};

use crate::{error::ChatError, protocol, registry::SessionRegistry, session::Session};

#[derive(Clone)]
pub struct MessageRouter {
    registry: Arc<SessionRegistry>,
}

impl MessageRouter {
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// Sends `text` to every registered session except `sender`.
    ///
    /// Returns how many sessions the line was written to.
    pub async fn broadcast(&self, text: &str, sender: Option<&Session>) -> usize {
        let recipients = self.registry.snapshot();
        let sender_id = sender.map(Session::id);

        let mut delivered = 0;
        let mut failed = Vec::new();
        for session in recipients {
            if Some(session.id()) == sender_id {
                continue;
            }
            match session.send(text).await {
                Ok(()) => delivered += 1,
                Err(err) => {
                    debug!(session = session.id(), error = %err, "broadcast write failed");
                    failed.push(session);
                }
            }
        }

        for session in failed {
            if session.begin_closing() {
                debug!(
                    session = session.id(),
                    nickname = ?session.nickname(),
                    "closing unreachable session"
                );
            }
        }

        delivered
    }

    /// Delivers `text` to the session registered as `target` only.
    ///
    /// The sender gets a confirmation on success or a notice explaining why
    /// nothing was delivered. No other session is touched.
    pub async fn whisper(&self, sender: &Session, target: &str, text: &str) {
        let from = sender.nickname().unwrap_or_default();

        let notice = match self.resolve_recipient(sender, target) {
            Ok(recipient) => match recipient.send(&protocol::whisper_from(from, text)).await {
                Ok(()) => protocol::whisper_to(target, text),
                Err(err) => {
                    debug!(session = recipient.id(), error = %err, "whisper write failed");
                    recipient.begin_closing();
                    protocol::not_found_notice(target)
                }
            },
            Err(ChatError::SelfWhisper) => protocol::SELF_WHISPER_NOTICE.to_string(),
            Err(err) => {
                debug!(session = sender.id(), error = %err, "whisper not delivered");
                protocol::not_found_notice(target)
            }
        };

        self.reply(sender, &notice).await;
    }

    fn resolve_recipient(&self, sender: &Session, target: &str) -> Result<Arc<Session>, ChatError> {
        let recipient = self
            .registry
            .lookup(target)
            .ok_or_else(|| ChatError::UnknownRecipient(target.to_string()))?;
        if recipient.id() == sender.id() {
            return Err(ChatError::SelfWhisper);
        }
        Ok(recipient)
    }

    /// Lists the active nicknames to `session` alone.
    pub async fn send_roster(&self, session: &Session) {
        let nicknames = self.registry.nicknames();
        self.reply(session, &protocol::roster_line(&nicknames)).await;
    }

    /// Writes a line to one session; a failed write asks that session to close.
    pub async fn reply(&self, session: &Session, line: &str) {
        if let Err(err) = session.send(line).await {
            debug!(session = session.id(), error = %err, "reply write failed");
            session.begin_closing();
        }
    }

    /// Finishes teardown for `session`: unregisters it, closes its writer,
    /// and announces the departure if it had joined.
    ///
    /// Only the call that actually removes the session from the registry
    /// announces it, so repeated calls produce at most one departure notice.
    /// A session that never joined goes straight to `Closed`.
    pub async fn disconnect(&self, session: &Session) -> Option<String> {
        if session.nickname().is_some() {
            session.begin_closing();
        }
        let nickname = self.registry.unregister(session);
        session.shutdown().await;
        session.mark_closed();

        if let Some(nickname) = &nickname {
            info!(session = session.id(), peer = ?session.peer(), %nickname, "client left");
            self.broadcast(&protocol::left_notice(nickname), None).await;
        }
        nickname
    }

    /// Asks every registered session to close, after telling them why.
    pub async fn close_all(&self, notice: &str) {
        self.broadcast(notice, None).await;
        for session in self.registry.snapshot() {
            session.begin_closing();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::{
        io::{BufReader, DuplexStream, duplex},
        time::timeout,
    };

    use super::*;
    use crate::session::SessionState;

    const QUIET: Duration = Duration::from_millis(100);

    struct Peer {
        session: Arc<Session>,
        inbox: BufReader<DuplexStream>,
    }

    impl Peer {
        async fn next(&mut self) -> Option<String> {
            match timeout(QUIET, protocol::read_line(&mut self.inbox, 1024)).await {
                Ok(line) => line.expect("readable line"),
                Err(_) => None,
            }
        }
    }

    fn join(router: &MessageRouter, id: u64, nickname: &str) -> Peer {
        let (writer, inbox) = duplex(1024);
        let session = Arc::new(Session::new(id, None, writer, Duration::from_secs(1)));
        session.start_negotiating();
        assert!(router.registry().register(&session, nickname));
        Peer {
            session,
            inbox: BufReader::new(inbox),
        }
    }

    fn router() -> MessageRouter {
        MessageRouter::new(Arc::new(SessionRegistry::new()))
    }

    #[tokio::test]
    async fn broadcast_skips_the_sender() {
        let router = router();
        let mut alice = join(&router, 1, "alice");
        let mut bob = join(&router, 2, "bob");
        let mut carol = join(&router, 3, "carol");

        let delivered = router.broadcast("alice> hello", Some(alice.session.as_ref())).await;

        assert_eq!(delivered, 2);
        assert_eq!(bob.next().await.as_deref(), Some("alice> hello"));
        assert_eq!(carol.next().await.as_deref(), Some("alice> hello"));
        assert_eq!(alice.next().await, None);
    }

    #[tokio::test]
    async fn failed_recipients_are_closed_after_delivery() {
        let router = router();
        let alice = join(&router, 1, "alice");
        let mut bob = join(&router, 2, "bob");
        let Peer {
            session: carol,
            inbox: carol_inbox,
        } = join(&router, 3, "carol");
        drop(carol_inbox);

        let delivered = router.broadcast("alice> hello", Some(alice.session.as_ref())).await;

        assert_eq!(delivered, 1);
        assert_eq!(bob.next().await.as_deref(), Some("alice> hello"));
        assert_eq!(carol.state(), SessionState::Closing);
        assert_eq!(bob.session.state(), SessionState::Active);
        // Closing is requested, teardown is left to the session's own task.
        assert_eq!(router.registry().len(), 3);
    }

    #[tokio::test]
    async fn whisper_reaches_only_the_target() {
        let router = router();
        let mut alice = join(&router, 1, "alice");
        let mut bob = join(&router, 2, "bob");
        let mut carol = join(&router, 3, "carol");

        router.whisper(&bob.session, "alice", "hi").await;

        assert_eq!(alice.next().await.as_deref(), Some("[whisper from bob] hi"));
        assert_eq!(bob.next().await.as_deref(), Some("[whisper to alice] hi"));
        assert_eq!(carol.next().await, None);
    }

    #[tokio::test]
    async fn whisper_to_unknown_nickname_notifies_sender_once() {
        let router = router();
        let mut alice = join(&router, 1, "alice");
        let mut bob = join(&router, 2, "bob");

        router.whisper(&bob.session, "carol", "anyone?").await;

        assert_eq!(bob.next().await.as_deref(), Some("[notice] carol not found"));
        assert_eq!(bob.next().await, None);
        assert_eq!(alice.next().await, None);
    }

    #[tokio::test]
    async fn whisper_to_self_is_refused() {
        let router = router();
        let mut alice = join(&router, 1, "alice");

        router.whisper(&alice.session, "alice", "echo").await;

        assert_eq!(
            alice.next().await.as_deref(),
            Some(protocol::SELF_WHISPER_NOTICE)
        );
        assert_eq!(alice.next().await, None);
    }

    #[tokio::test]
    async fn repeated_disconnect_announces_once() {
        let router = router();
        let alice = join(&router, 1, "alice");
        let mut bob = join(&router, 2, "bob");

        assert_eq!(router.disconnect(&alice.session).await.as_deref(), Some("alice"));
        assert_eq!(router.disconnect(&alice.session).await, None);

        assert_eq!(bob.next().await.as_deref(), Some("alice left"));
        assert_eq!(bob.next().await, None);
        assert_eq!(alice.session.state(), SessionState::Closed);
        assert!(router.registry().lookup("alice").is_none());
    }

    #[tokio::test]
    async fn closing_holder_is_still_announced_once() {
        let router = router();
        let old = join(&router, 1, "alice");
        let mut bob = join(&router, 2, "bob");
        assert!(old.session.begin_closing());

        let (writer, _inbox) = duplex(1024);
        let successor = Arc::new(Session::new(3, None, writer, Duration::from_secs(1)));
        successor.start_negotiating();
        assert!(!router.registry().register(&successor, "alice"));

        assert_eq!(router.disconnect(&old.session).await.as_deref(), Some("alice"));
        assert_eq!(bob.next().await.as_deref(), Some("alice left"));
        assert_eq!(bob.next().await, None);

        // The name is free once the old holder's teardown has finished.
        assert!(router.registry().register(&successor, "alice"));
    }

    #[tokio::test]
    async fn disconnect_before_joining_announces_nothing() {
        let router = router();
        let mut bob = join(&router, 1, "bob");
        let (writer, _inbox) = duplex(1024);
        let lurker = Session::new(2, None, writer, Duration::from_secs(1));
        lurker.start_negotiating();

        assert_eq!(router.disconnect(&lurker).await, None);
        assert_eq!(lurker.state(), SessionState::Closed);
        assert_eq!(bob.next().await, None);
    }

    #[tokio::test]
    async fn roster_lists_everyone_to_the_asker() {
        let router = router();
        let mut alice = join(&router, 1, "alice");
        let mut bob = join(&router, 2, "bob");

        router.send_roster(&bob.session).await;

        assert_eq!(bob.next().await.as_deref(), Some("[online] alice, bob"));
        assert_eq!(alice.next().await, None);
    }

    #[tokio::test]
    async fn close_all_notifies_then_requests_close() {
        let router = router();
        let mut alice = join(&router, 1, "alice");
        let mut bob = join(&router, 2, "bob");

        router.close_all(protocol::SHUTDOWN_NOTICE).await;

        assert_eq!(alice.next().await.as_deref(), Some(protocol::SHUTDOWN_NOTICE));
        assert_eq!(bob.next().await.as_deref(), Some(protocol::SHUTDOWN_NOTICE));
        assert_eq!(alice.session.state(), SessionState::Closing);
        assert_eq!(bob.session.state(), SessionState::Closing);
    }
}
