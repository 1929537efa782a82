//! Shared helpers for pool and registry tests.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::connection::ControlConnection;
use crate::fake::{FakeTransportBuilder, FakeTransportController};
use crate::pool::Connector;

/// A connector backed by fake transports. The returned vec keeps every
/// controller alive; dropping a controller disconnects its connection.
pub(crate) fn fake_connector() -> (Connector, Arc<Mutex<Vec<FakeTransportController>>>) {
    let held: Arc<Mutex<Vec<FakeTransportController>>> = Arc::new(Mutex::new(Vec::new()));
    let held_by_connector = Arc::clone(&held);
    let connector: Connector = Arc::new(move |id, monitor| {
        let (parts, controller) = FakeTransportBuilder::new().build();
        held_by_connector.lock().push(controller);
        let conn = ControlConnection::from_parts(parts, Some((id, monitor)));
        Box::pin(async move { Ok(conn) })
    });
    (connector, held)
}
