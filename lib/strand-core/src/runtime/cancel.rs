use std::sync::{Arc, Mutex};

use snafu::Snafu;

use crate::{effect::node::Node, sync::lock, EffectError, Io};

/// Cancellation token error.
#[derive(Debug, Snafu)]
pub enum CancelTokenError {
    /// The token was already completed with a cancel action.
    #[snafu(display("Cancellation token was already completed."))]
    AlreadyCompleted,
}

enum TokenState {
    Pending,
    Active(Node),
    Canceled,
    Completed,
}

/// Why a cancel action was not stored.
pub(crate) enum Rejected {
    /// The token was canceled first: the action must run now.
    Canceled(Node),

    /// The token already holds an action.
    AlreadyCompleted,
}

/// A cancellation token that can be canceled before the action it forwards to is known.
///
/// Asynchronous operations often learn how to cancel themselves only once registration completes, while cancellation
/// may be requested at any point. `ForwardCancelable` bridges the two: [`cancel`][Self::cancel] runs the action if one
/// was stored, and otherwise marks the token so that [`complete`][Self::complete] runs the action as soon as it
/// arrives.
///
/// Canceling is idempotent and safe to call from any number of threads: the action runs at most once.
#[derive(Clone)]
pub struct ForwardCancelable {
    state: Arc<Mutex<TokenState>>,
}

impl ForwardCancelable {
    /// Creates a new, pending token.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(TokenState::Pending)),
        }
    }

    /// Returns `true` if the token was canceled.
    pub fn is_canceled(&self) -> bool {
        matches!(&*lock(&self.state), TokenState::Canceled)
    }

    /// Returns an effect which stores the cancel action.
    ///
    /// If the token was already canceled, the action runs immediately instead.
    ///
    /// ## Errors
    ///
    /// If the token already holds an action, the effect fails with [`CancelTokenError::AlreadyCompleted`].
    pub fn complete(&self, action: Io<()>) -> Io<()> {
        let token = self.clone();
        Io::defer(move || match token.complete_node(action.into_node()) {
            Ok(()) => Io::unit(),
            Err(Rejected::Canceled(action)) => Io::from_node(action),
            Err(Rejected::AlreadyCompleted) => Io::raise_error(EffectError::new(CancelTokenError::AlreadyCompleted)),
        })
    }

    /// Returns an effect which cancels the token, running the stored action if there is one.
    pub fn cancel(&self) -> Io<()> {
        let token = self.clone();
        Io::defer(move || match token.cancel_node() {
            Some(action) => Io::from_node(action),
            None => Io::unit(),
        })
    }

    pub(crate) fn complete_node(&self, action: Node) -> Result<(), Rejected> {
        let mut state = lock(&self.state);
        match &*state {
            TokenState::Pending => {}
            TokenState::Canceled => return Err(Rejected::Canceled(action)),
            TokenState::Active(_) | TokenState::Completed => return Err(Rejected::AlreadyCompleted),
        }
        *state = TokenState::Active(action);
        Ok(())
    }

    /// Marks the token as canceled, handing out the stored action if there is one.
    pub(crate) fn cancel_node(&self) -> Option<Node> {
        let mut state = lock(&self.state);
        match std::mem::replace(&mut *state, TokenState::Canceled) {
            TokenState::Active(action) => Some(action),
            TokenState::Pending | TokenState::Canceled => None,
            TokenState::Completed => {
                *state = TokenState::Completed;
                None
            }
        }
    }

    /// Discards the stored action without running it.
    pub(crate) fn dismiss(&self) {
        let mut state = lock(&self.state);
        if !matches!(&*state, TokenState::Canceled) {
            *state = TokenState::Completed;
        }
    }
}

impl Default for ForwardCancelable {
    fn default() -> Self {
        Self::new()
    }
}
