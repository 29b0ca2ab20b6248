pub mod authorization; // cached authorization decisions
pub mod authorizer; // per-metric authorization from backend usage reports
pub mod backend; // usage backend client
pub mod credentials; // application credentials and their canonical form
pub mod error; // error handling
pub mod flusher; // periodic report and authorization renewal cycle
pub mod kv_store; // key-value store and pub/sub abstractions
pub mod observability; // log setup
pub mod priority_auth_renewer; // on-demand authorization renewal over pub/sub
pub mod redis_client; // redis client
pub mod runner; // wiring and supervision
pub mod storage; // cached reports and authorizations
pub mod storage_keys; // key and channel names shared with the gateway
mod testing;
pub mod worker_pool; // bounded async task pool
