use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::Mutex;
use tracing::{debug, error, info};

use crate::config::{is_trusted_origin, CoordinatorConfig};
use crate::error::RegistrationError;
use crate::host::{InterceptHandle, InterceptHost};

/// Resolves the single intercept context for the page and remembers it.
///
/// Concurrent callers queue behind one in-flight resolution, so at most one
/// install is ever issued per successful registration.
pub struct Registrar {
    host: Arc<dyn InterceptHost>,
    origin: String,
    scope: String,
    script_url: String,
    activation_timeout: Duration,
    resolved: RwLock<Option<InterceptHandle>>,
    in_flight: Mutex<()>,
}

impl Registrar {
    pub fn new(host: Arc<dyn InterceptHost>, config: &CoordinatorConfig) -> Self {
        Self {
            host,
            origin: config.origin.clone(),
            scope: config.scope.clone(),
            script_url: config.script_url(),
            activation_timeout: config.activation_timeout,
            resolved: RwLock::new(None),
            in_flight: Mutex::new(()),
        }
    }

    pub fn handle(&self) -> Option<InterceptHandle> {
        self.resolved.read().clone()
    }

    pub async fn register(&self) -> Result<InterceptHandle, RegistrationError> {
        if let Some(handle) = self.handle() {
            return Ok(handle);
        }
        let _resolving = self.in_flight.lock().await;
        if let Some(handle) = self.handle() {
            return Ok(handle);
        }

        match self.resolve().await {
            Ok(handle) => {
                info!(scope = %self.scope, script = handle.script_url(), "intercept context ready");
                *self.resolved.write() = Some(handle.clone());
                Ok(handle)
            }
            Err(err) => {
                error!(scope = %self.scope, error = %err, "intercept context registration failed");
                Err(err)
            }
        }
    }

    async fn resolve(&self) -> Result<InterceptHandle, RegistrationError> {
        if !is_trusted_origin(&self.origin) {
            return Err(RegistrationError::UntrustedOrigin(self.origin.clone()));
        }
        if let Some(existing) = self.host.registration(&self.scope).await? {
            debug!(scope = %self.scope, "adopting existing intercept registration");
            existing.wait_active(self.activation_timeout).await?;
            return Ok(existing);
        }
        debug!(scope = %self.scope, script = %self.script_url, "installing intercept context");
        let installed = self.host.install(&self.script_url, &self.scope).await?;
        installed.wait_active(self.activation_timeout).await?;
        Ok(installed)
    }

}
