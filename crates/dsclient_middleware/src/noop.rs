//! The empty middleware.

use dsclient_core::Middleware;

/// Forwards every operation unchanged.
///
/// Useful as a placeholder and as a starting point for middlewares that only
/// intercept a few operations.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMiddleware;

impl Middleware for NoopMiddleware {}
