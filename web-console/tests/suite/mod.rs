mod fetch;
mod support;
mod websocket;
