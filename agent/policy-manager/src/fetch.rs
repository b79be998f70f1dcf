//! Fetch matrix: directives for proactively requesting signals, gathered
//! from the enabled schemes.

use cloud_schema::{CollectionScheme, FetchInformation, SyncId};
use signal_core::SignalId;

/// One fetch directive with its owning scheme.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchDirective {
    pub scheme_id: SyncId,
    pub info: FetchInformation,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FetchMatrix {
    pub directives: Vec<FetchDirective>,
}

impl FetchMatrix {
    pub fn directives_for(&self, signal_id: SignalId) -> impl Iterator<Item = &FetchDirective> {
        self.directives
            .iter()
            .filter(move |d| d.info.target_signal_id == signal_id)
    }
}

pub fn extract_fetch_matrix(schemes: &[&CollectionScheme]) -> FetchMatrix {
    let mut matrix = FetchMatrix::default();
    for scheme in schemes {
        for info in &scheme.fetch_informations {
            matrix.directives.push(FetchDirective {
                scheme_id: scheme.scheme_id.clone(),
                info: info.clone(),
            });
        }
    }
    matrix
}
