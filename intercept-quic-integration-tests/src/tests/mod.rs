mod echo_test;
mod endpoint_test;
mod forward_test;
mod handshake_test;
