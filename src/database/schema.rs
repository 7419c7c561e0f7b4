// Schema for the activity store.
// Statements are idempotent so the schema can be applied on every start.

pub const INITIAL_SCHEMA: &str = include_str!("../../migrations/001_initial_schema.sql");

pub const MIGRATIONS: &[(&str, &str)] = &[("001_initial_schema", INITIAL_SCHEMA)];
