//! Chrome DevTools Protocol backend: tab discovery over the debugging
//! port's HTTP endpoints, commands over the tab's websocket.

mod session;
mod transport;

pub use session::{BrowserConfig, ChromeSession};
pub use transport::{CdpConnection, DevtoolsEndpoint, TabInfo};
