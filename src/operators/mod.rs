pub mod chunk_operator;
pub mod crawl_operator;
pub mod message_operator;
pub mod model_operator;
pub mod page_operator;
pub mod parse_operator;
pub mod qdrant_operator;
pub mod redis_operator;
pub mod search_operator;
pub mod site_operator;
