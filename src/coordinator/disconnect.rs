use log::{debug, info};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{desynchronized, Coordinator};
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DisconnectReason {
    /// DISCONNECT packet received, the will is discarded.
    Graceful,
    /// Transport failure or keep alive expiry, the will is published.
    Ungraceful,
}

impl Coordinator {
    /// Invalidates the connection `connection_id` of `client_id`.
    ///
    /// Ignored when another connection took over the client id in the
    /// meantime.
    pub fn on_disconnect(
        &self,
        client_id: &str,
        connection_id: Uuid,
        reason: DisconnectReason,
    ) -> Result<()> {
        let descriptor = match self.connections.remove(client_id, connection_id) {
            Some(descriptor) => descriptor,
            None => {
                debug!(
                    "[Coordinator->Disconnect] ignoring stale connection {} of {}",
                    connection_id, client_id
                );
                return Ok(());
            }
        };
        self.metrics.disconnected();
        info!(
            "[Coordinator->Disconnect] {} disconnected ({:?})",
            client_id, reason
        );

        for done in self.acks.release_recipient(client_id) {
            self.complete(done)?;
        }
        if descriptor.clean_session {
            self.wipe_session(client_id)?;
        }

        let will = self.wills.take(client_id);
        match (reason, will) {
            (DisconnectReason::Ungraceful, Some(will)) => {
                desynchronized(self.publish_will(client_id, will)?)
            }
            (DisconnectReason::Graceful, Some(_)) => {
                debug!("[Coordinator->Disconnect] discarded will of {}", client_id);
                Ok(())
            }
            (_, None) => Ok(()),
        }
    }
}
