//! In-memory mailbox registry.

use crate::types::Mailbox;

/// Mailboxes from the latest successful listing.
#[derive(Debug, Clone, Default)]
pub struct MailboxRegistry {
    mailboxes: Vec<Mailbox>,
    loading: bool,
}

impl MailboxRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mailboxes(&self) -> &[Mailbox] {
        &self.mailboxes
    }

    /// Mailboxes shown to the user, skipping non-mail folders when asked to.
    pub fn visible(&self, hide_non_mail: bool) -> Vec<Mailbox> {
        self.mailboxes
            .iter()
            .filter(|m| !(hide_non_mail && m.is_hidden))
            .cloned()
            .collect()
    }

    /// Drop every known mailbox and start over from `names`.
    pub fn replace(&mut self, names: Vec<String>) {
        self.mailboxes = names.into_iter().map(Mailbox::new).collect();
    }

    /// Set the count of the mailbox at `index` in the current listing.
    pub fn set_count_at(&mut self, index: usize, count: u64) -> bool {
        match self.mailboxes.get_mut(index) {
            Some(mailbox) => {
                mailbox.message_count = Some(count);
                true
            }
            None => false,
        }
    }

    /// Set the count of every mailbox called `name`.
    pub fn set_count(&mut self, name: &str, count: u64) -> bool {
        let mut found = false;
        for mailbox in self.mailboxes.iter_mut().filter(|m| m.name == name) {
            mailbox.message_count = Some(count);
            found = true;
        }
        found
    }

    pub fn find(&self, name: &str) -> Option<&Mailbox> {
        self.mailboxes.iter().find(|m| m.name == name)
    }

    pub fn clear(&mut self) {
        self.mailboxes.clear();
    }

    pub fn len(&self) -> usize {
        self.mailboxes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mailboxes.is_empty()
    }

    pub fn is_loading(&self) -> bool {
        self.loading
    }

    pub fn set_loading(&mut self, loading: bool) {
        self.loading = loading;
    }
}
