pub mod download_link_helpers;
pub mod downloads;
pub mod orders;
