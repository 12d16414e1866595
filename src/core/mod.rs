pub mod alias;
pub mod alias_index;
pub mod assembler;
pub mod builder;
pub mod external;
pub mod gate;
pub mod intent;
pub mod pipeline;
pub mod profiles;
pub mod schema_cache;
pub mod templates;
