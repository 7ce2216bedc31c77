//! Identity of the local user.

use tokio::sync::watch;
use uuid::Uuid;

use crate::state::game::PlayerId;

/// Source of the stable user id the store's access rules are evaluated against.
pub trait AuthProvider: Send + Sync {
    /// Id of the signed-in user, if any.
    fn current_user_id(&self) -> Option<PlayerId>;
    /// Observe sign-in and sign-out.
    fn on_auth_change(&self) -> watch::Receiver<Option<PlayerId>>;
}

/// Provider whose identity is set explicitly.
#[derive(Debug)]
pub struct StaticAuth {
    user: watch::Sender<Option<PlayerId>>,
}

impl StaticAuth {
    /// Provider already signed in as `user_id`.
    pub fn signed_in(user_id: impl Into<PlayerId>) -> Self {
        let (user, _rx) = watch::channel(Some(user_id.into()));
        Self { user }
    }

    /// Provider signed in with a fresh anonymous id.
    pub fn anonymous() -> Self {
        Self::signed_in(Uuid::new_v4().simple().to_string())
    }

    /// Provider without a user.
    pub fn signed_out() -> Self {
        let (user, _rx) = watch::channel(None);
        Self { user }
    }

    /// Switch to `user_id`, notifying every watcher.
    pub fn sign_in(&self, user_id: impl Into<PlayerId>) {
        self.user.send_replace(Some(user_id.into()));
    }

    /// Drop the current user.
    pub fn sign_out(&self) {
        self.user.send_replace(None);
    }
}

impl AuthProvider for StaticAuth {
    fn current_user_id(&self) -> Option<PlayerId> {
        self.user.borrow().clone()
    }

    fn on_auth_change(&self) -> watch::Receiver<Option<PlayerId>> {
        self.user.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sign_in_and_out_are_observable() {
        let auth = StaticAuth::signed_out();
        let mut changes = auth.on_auth_change();
        assert_eq!(auth.current_user_id(), None);

        auth.sign_in("U1");
        changes.changed().await.unwrap();
        assert_eq!(changes.borrow_and_update().as_deref(), Some("U1"));

        auth.sign_out();
        changes.changed().await.unwrap();
        assert_eq!(*changes.borrow_and_update(), None);
    }

    #[test]
    fn anonymous_ids_are_unique() {
        let a = StaticAuth::anonymous().current_user_id().unwrap();
        let b = StaticAuth::anonymous().current_user_id().unwrap();
        assert_ne!(a, b);
    }
}
