//! Write/read round trip against a freshly opened session.
//!
//! Writes a small text file to the root of the default storage, finds it
//! again by name, reads it back and checks the bytes match.

use log::{debug, info, warn};
use serde::Serialize;

use crate::backend::ProtocolSession;
use crate::device::ObjectHandle;
use crate::session::SessionError;
use crate::settings::DemoSettings;
use crate::store::ObjectStore;

/// Outcome of one round trip.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoundTripReport {
    pub device_id: String,
    pub handle: ObjectHandle,
    pub bytes: u64,
    /// The read-back content, decoded as UTF-8 (lossy).
    pub text: String,
    /// Whether the read-back bytes equal what was written.
    pub matches: bool,
}

/// Runs the round trip on the store's default storage.
pub async fn run_round_trip<S: ProtocolSession>(
    store: &ObjectStore<S>,
    settings: &DemoSettings,
) -> Result<RoundTripReport, SessionError> {
    let storage = store.default_storage()?;
    info!(
        "Round trip on {}: writing {} to {}",
        store.device_id(),
        settings.file_name,
        storage.description
    );
    let storage = storage.id;
    let content = settings.content.as_bytes();

    let written = store
        .create_file(storage, &settings.file_name, content, None, settings.replace_existing)
        .await?;
    debug!("Round trip: wrote handle {}", written.handle.0);

    // Find it again the way a user would, by name
    let mut listing = store.list_objects(storage, Some(&settings.file_name));
    let mut found = None;
    while let Some(object) = listing.next().await {
        let object = object?;
        if object.handle == written.handle {
            found = Some(object);
            break;
        }
    }
    let Some(found) = found else {
        warn!("Round trip: {} not listed after write", settings.file_name);
        return Err(SessionError::ObjectNotFound {
            device_id: store.device_id().to_string(),
            handle: written.handle.0,
        });
    };

    let data = store.read_object(found.object_ref()).await?;
    let matches = data == content;
    if !matches {
        warn!(
            "Round trip: read {} bytes, expected {} bytes of identical content",
            data.len(),
            content.len()
        );
    }

    let report = RoundTripReport {
        device_id: store.device_id().to_string(),
        handle: found.handle,
        bytes: data.len() as u64,
        text: String::from_utf8_lossy(&data).into_owned(),
        matches,
    };
    info!("Round trip on {} read back: {:?}", report.device_id, report.text);
    Ok(report)
}
