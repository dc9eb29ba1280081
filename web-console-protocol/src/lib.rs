mod jsonrpc;
mod webview;

pub use jsonrpc::Decoded;
pub use jsonrpc::RequestId;
pub use jsonrpc::RpcMessage;
pub use jsonrpc::RpcNotification;
pub use jsonrpc::RpcRequest;
pub use jsonrpc::RpcResponse;
pub use jsonrpc::decode_line;
pub use webview::ClientFrame;
pub use webview::FetchRequest;
pub use webview::FetchResponseType;
pub use webview::ForwardedNotification;
pub use webview::ForwardedRequest;
pub use webview::ServerFrame;
pub use webview::StatusEvent;
pub use webview::WebviewInbound;
pub use webview::WebviewOutbound;
