//! Dual-shadow values: the locally desired copy and the authority-confirmed
//! copy of one participant field, with the request/acknowledge rule that
//! reconciles them.

/// `local` is what the owning side shows right now, `authority` is the last
/// value confirmed by the authority. `pending` holds the sequence number of
/// the newest request not yet acknowledged.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Shadowed<T> {
    local: T,
    authority: T,
    pending: Option<u32>,
}

impl<T: Clone + PartialEq> Shadowed<T> {
    pub fn new(value: T) -> Self {
        Self {
            local: value.clone(),
            authority: value,
            pending: None,
        }
    }

    pub fn local(&self) -> &T {
        &self.local
    }

    pub fn authority(&self) -> &T {
        &self.authority
    }

    pub fn pending(&self) -> Option<u32> {
        self.pending
    }

    pub fn is_dirty(&self) -> bool {
        self.pending.is_some()
    }

    /// Optimistic write on the non-authority side. The caller sends the
    /// request regardless; the return value says whether the local copy
    /// changed and a local notification is due.
    pub fn request(&mut self, value: T, sequence: u32) -> bool {
        self.pending = Some(self.pending.map_or(sequence, |p| p.max(sequence)));
        if self.local == value {
            return false;
        }
        self.local = value;
        true
    }

    /// Authority-side write. Returns true if the authoritative value changed.
    pub fn confirm(&mut self, value: T) -> bool {
        let changed = self.authority != value;
        self.local = value.clone();
        self.authority = value;
        self.pending = None;
        changed
    }

    /// Applies a propagated authority value that acknowledges requests up to
    /// `acked`.
    ///
    /// While a newer request is unacknowledged the local copy is kept. Returns
    /// the new local value when it had to be overwritten, `None` when it
    /// already matched.
    pub fn reconcile(&mut self, value: T, acked: u32) -> Option<T> {
        self.authority = value;

        if let Some(pending) = self.pending {
            if acked < pending {
                return None;
            }
            self.pending = None;
        }

        if self.local == self.authority {
            return None;
        }

        self.local = self.authority.clone();
        Some(self.local.clone())
    }
}
