pub mod envelope;
pub mod types;

pub use envelope::{Envelope, kind};
pub use types::{
    ConnectedPayload, DeviceInfoPayload, ErrorPayload, ProxyErrorPayload, ProxyHttpRequestPayload,
    ProxyRequest, ProxyResponse, TunnelClosePayload, TunnelClosedPayload, TunnelConnectPayload,
    TunnelDataPayload,
};
