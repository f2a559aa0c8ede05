use std::fmt::{self, Debug, Formatter};
use std::sync::{Arc, PoisonError, RwLock};

use crate::message::TextMessage;

/// An interceptor may transform a message or drop it by returning `None`.
pub type Interceptor = Arc<dyn Fn(TextMessage) -> Option<TextMessage> + Send + Sync>;

/// Ordered list of interceptors applied to every message before it is dispatched.
///
/// Interceptors can be registered while consumption is running; a message already inside
/// `intercept` sees the list as it was when the fold started.
#[derive(Default)]
pub struct InterceptorChain {
    interceptors: RwLock<Vec<Interceptor>>,
}

impl InterceptorChain {
    pub fn new() -> Self {
        InterceptorChain::default()
    }

    pub fn register<F>(&self, interceptor: F)
    where
        F: Fn(TextMessage) -> Option<TextMessage> + Send + Sync + 'static,
    {
        self.interceptors
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(interceptor));
    }

    /// Folds the message through all interceptors in registration order. The first `None`
    /// short-circuits the chain.
    pub fn intercept(&self, message: TextMessage) -> Option<TextMessage> {
        let interceptors = self
            .interceptors
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        interceptors
            .iter()
            .try_fold(message, |message, interceptor| interceptor(message))
    }

    pub fn len(&self) -> usize {
        self.interceptors
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Debug for InterceptorChain {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("InterceptorChain")
            .field("interceptors", &self.len())
            .finish()
    }
}
