//! Record identifier factory.

use uuid::Uuid;

/// Returns a fresh random record identifier.
pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}
