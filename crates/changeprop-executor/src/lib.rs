pub mod broadcast;
pub mod context;
pub mod error;
pub mod executor;
pub mod http_client;
pub mod registry;
pub mod reporter;
pub mod retry_executor;
pub mod rule_executor;
pub mod watermark;

#[cfg(test)]
mod test_support;
