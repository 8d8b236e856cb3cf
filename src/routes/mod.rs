//! HTTP route handlers.
//!
//! Each submodule corresponds to a logical area of the API and exposes
//! typed Rocket handlers annotated with `#[openapi]` so `rocket_okapi`
//! can derive an OpenAPI document automatically. Import endpoints are
//! scoped to a caller-chosen session via the `X-Import-Session` header.

pub mod health;
pub mod imports;
