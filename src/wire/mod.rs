pub mod codec;

#[cfg(test)]
pub(crate) mod fake_server;
