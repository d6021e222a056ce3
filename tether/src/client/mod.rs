// Client-side proxy objects
//
// INTENTION:
// Concrete proxies built on ProxyBase and the readiness helper. Connection
// shows the plain shape (status lifecycle, optional capabilities feature);
// CallStream shows the change-queue shape, where remote membership updates
// go through an ordered lookup queue before touching proxy state.

pub mod call_stream;
pub mod connection;
pub mod contact;
