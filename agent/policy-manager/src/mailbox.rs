//! Single-slot ingress mailboxes for the policy manager.
//!
//! Each slot holds at most the latest value: a writer overwrites whatever is
//! pending, the reader swaps the slot out. All three slots share one notify
//! so the manager has a single wake-up point.

use std::sync::Mutex;

use tokio::sync::Notify;

/// The three schema ingress slots plus the shared wake-up.
#[derive(Default)]
pub struct SchemaInbox {
    manifest: Mutex<Option<Vec<u8>>>,
    scheme_list: Mutex<Option<Vec<u8>>>,
    state_templates: Mutex<Option<Vec<u8>>>,
    notify: Notify,
}

impl SchemaInbox {
    pub fn post_manifest(&self, payload: Vec<u8>) {
        *self.manifest.lock().expect("inbox poisoned") = Some(payload);
        self.notify.notify_one();
    }

    pub fn post_scheme_list(&self, payload: Vec<u8>) {
        *self.scheme_list.lock().expect("inbox poisoned") = Some(payload);
        self.notify.notify_one();
    }

    pub fn post_state_templates(&self, payload: Vec<u8>) {
        *self.state_templates.lock().expect("inbox poisoned") = Some(payload);
        self.notify.notify_one();
    }

    pub(crate) fn take_manifest(&self) -> Option<Vec<u8>> {
        self.manifest.lock().expect("inbox poisoned").take()
    }

    pub(crate) fn take_scheme_list(&self) -> Option<Vec<u8>> {
        self.scheme_list.lock().expect("inbox poisoned").take()
    }

    pub(crate) fn take_state_templates(&self) -> Option<Vec<u8>> {
        self.state_templates.lock().expect("inbox poisoned").take()
    }

    pub(crate) async fn notified(&self) {
        self.notify.notified().await;
    }
}
