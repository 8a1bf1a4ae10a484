//! Concrete download clients. Each one implements
//! [`DownloaderProvider`](crate::engine::provider::DownloaderProvider) for a single service.

pub mod direct;
