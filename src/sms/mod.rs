//! SMS list & multipart reassembly engine.
//!
//! [`SmsPartStore`] indexes raw [`SmsPart`]s by `(storage, index)` and
//! reassembles multipart ("concatenated") messages by `(reference, sender)`,
//! exposing a flat list of [`Sms`] values and emitting `added`/`deleted`
//! events the out-of-scope DBus binding layer would publish.
//!
//! `gsm7` and `ucs2` are the two text-encoding codecs SMS PDUs carry;
//! `pdu` decodes/encodes the wire PDUs themselves, producing the
//! [`SmsPart`] values this module's store consumes.

pub mod gsm7;
pub mod pdu;
pub mod ucs2;

use std::collections::BTreeMap;

use crate::error::{CoreError, Result};

/// Where an SMS part is (or was) stored on the modem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Storage {
    Sm,
    Me,
    Mt,
    Sr,
}

/// PDU type a part was decoded from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PduType {
    Deliver,
    Submit,
    StatusReport,
}

/// Concatenation info carried by a multipart SMS part's UDH.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MultipartInfo {
    pub reference: u16,
    pub max: u8,
    pub sequence: u8,
}

/// A part's decoded user data: either text (GSM-7/UCS-2 decoded) or raw
/// 8-bit application data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SmsContent {
    Text(String),
    Data(Vec<u8>),
}

/// One decoded SMS PDU, not yet reassembled into an [`Sms`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmsPart {
    pub storage: Storage,
    pub index: Option<u32>,
    pub sender: String,
    pub content: SmsContent,
    pub pdu_type: PduType,
    pub multipart: Option<MultipartInfo>,
}

/// Multipart reassembly state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmsState {
    Receiving,
    Received,
    Stored,
    Sent,
    Sending,
    Unknown,
}

/// A fully reassembled (or single-PDU) SMS.
#[derive(Debug, Clone)]
pub enum SmsBody {
    Singlepart(SmsPart),
    Multipart { reference: u16, sender: String, max: u8, parts: BTreeMap<u8, SmsPart>, state: SmsState },
}

/// An SMS tracked by the store, with a stable path assigned once at
/// creation (the store's equivalent of "assigned on first export").
#[derive(Debug, Clone)]
pub struct Sms {
    pub path: u32,
    pub body: SmsBody,
}

impl Sms {
    /// Whether this object is currently in a state an external observer
    /// would describe as "still arriving or freshly arrived" (used for the
    /// `added(path, is_receive)` event payload).
    pub fn is_receive(&self) -> bool {
        match &self.body {
            SmsBody::Singlepart(part) => part.pdu_type == PduType::Deliver,
            SmsBody::Multipart { state, .. } => matches!(state, SmsState::Receiving | SmsState::Received),
        }
    }

    /// Concatenated text across all parts, in sequence order. Parts whose
    /// content is raw data rather than text are rendered as an empty
    /// string for their slot.
    pub fn text(&self) -> String {
        match &self.body {
            SmsBody::Singlepart(part) => content_text(&part.content),
            SmsBody::Multipart { parts, .. } => {
                parts.values().map(|part| content_text(&part.content)).collect::<Vec<_>>().join("")
            },
        }
    }
}

fn content_text(content: &SmsContent) -> String {
    match content {
        SmsContent::Text(text) => text.clone(),
        SmsContent::Data(_) => String::new(),
    }
}

/// Store-level events, the concrete payloads of the out-of-scope DBus
/// `added`/`deleted` signals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreEvent {
    Added { path: u32, is_receive: bool },
    Deleted { path: u32 },
}

type EventSink = Box<dyn FnMut(StoreEvent)>;

/// Per-modem index of SMS parts, reassembling multipart messages as parts
/// arrive.
pub struct SmsPartStore {
    next_path: u32,
    list: Vec<Sms>,
    taken: BTreeMap<(Storage, u32), ()>,
    events: EventSink,
}

impl SmsPartStore {
    pub fn new(events: EventSink) -> Self {
        Self { next_path: 1, list: Vec::new(), taken: BTreeMap::new(), events }
    }

    /// Accept `part`, reassembling it into an existing multipart `Sms` if
    /// one is already being built for its `(reference, sender)`, else
    /// creating a new one. Returns the path of the `Sms` the part landed
    /// in.
    pub fn take_part(&mut self, part: SmsPart, initial_state: SmsState) -> Result<u32> {
        if let Some(index) = part.index {
            let key = (part.storage, index);
            if self.taken.contains_key(&key) {
                return Err(CoreError::AlreadyExists.into());
            }
            self.taken.insert(key, ());
        }

        let Some(multipart) = part.multipart else {
            let path = self.allocate_path();
            let is_receive = part.pdu_type == PduType::Deliver;
            self.list.push(Sms { path, body: SmsBody::Singlepart(part) });
            self.emit(StoreEvent::Added { path, is_receive });
            return Ok(path);
        };

        if let Some(sms) = self.find_multipart_mut(multipart.reference, &part.sender) {
            let path = sms.path;
            let SmsBody::Multipart { parts, max, state, .. } = &mut sms.body else {
                unreachable!("find_multipart_mut only returns Multipart bodies")
            };
            if parts.contains_key(&multipart.sequence) {
                return Err(CoreError::AlreadyExists.into());
            }
            parts.insert(multipart.sequence, part);
            if parts.len() as u8 == *max {
                *state = SmsState::Received;
            }
            return Ok(path);
        }

        let path = self.allocate_path();
        let reference = multipart.reference;
        let sender = part.sender.clone();
        let max = multipart.max;
        let sequence = multipart.sequence;
        let mut parts = BTreeMap::new();
        parts.insert(sequence, part);
        let state = if max == 1 { SmsState::Received } else { initial_state };
        self.list.push(Sms { path, body: SmsBody::Multipart { reference, sender, max, parts, state } });
        self.emit(StoreEvent::Added { path, is_receive: matches!(state, SmsState::Receiving | SmsState::Received) });
        Ok(path)
    }

    /// Remove the `Sms` at `path` once `delete_from_modem` (the caller's
    /// storage-deletion operation, delegated since the store itself has no
    /// transport) completes successfully.
    pub fn delete(
        &mut self,
        path: u32,
        delete_from_modem: impl FnOnce(Box<dyn FnOnce(Result<()>)>),
        on_done: impl FnOnce(Result<()>) + 'static,
    ) {
        if !self.list.iter().any(|sms| sms.path == path) {
            on_done(Err(CoreError::NotFound.into()));
            return;
        }

        delete_from_modem(Box::new(move |result| on_done(result)));
    }

    /// Finalize a deletion once the underlying storage-deletion callback
    /// has resolved successfully; callers invoke this from the
    /// `delete_from_modem` completion they supplied to [`Self::delete`].
    pub fn finish_delete(&mut self, path: u32) {
        if let Some(index) = self.list.iter().position(|sms| sms.path == path) {
            self.list.remove(index);
            self.emit(StoreEvent::Deleted { path });
        }
    }

    /// Whether the store already owns an outbound (`Submit`) multipart
    /// addressed to `number` using `reference`, so a caller picking a
    /// fresh reference for a new outbound send can avoid collisions.
    pub fn has_local_multipart_reference(&self, number: &str, reference: u16) -> bool {
        self.list.iter().any(|sms| match &sms.body {
            SmsBody::Multipart { reference: r, sender, parts, .. } => {
                *r == reference
                    && sender == number
                    && parts.values().next().is_some_and(|part| part.pdu_type == PduType::Submit)
            },
            SmsBody::Singlepart(_) => false,
        })
    }

    pub fn get(&self, path: u32) -> Option<&Sms> {
        self.list.iter().find(|sms| sms.path == path)
    }

    pub fn list(&self) -> &[Sms] {
        &self.list
    }

    fn find_multipart_mut(&mut self, reference: u16, sender: &str) -> Option<&mut Sms> {
        self.list.iter_mut().find(|sms| match &sms.body {
            SmsBody::Multipart { reference: r, sender: s, .. } => *r == reference && s == sender,
            SmsBody::Singlepart(_) => false,
        })
    }

    fn allocate_path(&mut self) -> u32 {
        let path = self.next_path;
        self.next_path += 1;
        path
    }

    fn emit(&mut self, event: StoreEvent) {
        (self.events)(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn part(sender: &str, index: u32, text: &str, multipart: Option<MultipartInfo>) -> SmsPart {
        SmsPart {
            storage: Storage::Me,
            index: Some(index),
            sender: sender.into(),
            content: SmsContent::Text(text.into()),
            pdu_type: PduType::Deliver,
            multipart,
        }
    }

    #[test]
    fn singlepart_emits_added_once() {
        let events = std::rc::Rc::new(std::cell::RefCell::new(Vec::new()));
        let events_clone = events.clone();
        let mut store = SmsPartStore::new(Box::new(move |event| events_clone.borrow_mut().push(event)));

        let path = store.take_part(part("+12025551212", 0, "hi", None), SmsState::Received).unwrap();
        assert_eq!(events.borrow().as_slice(), &[StoreEvent::Added { path, is_receive: true }]);
    }

    #[test]
    fn duplicate_index_is_rejected() {
        let mut store = SmsPartStore::new(Box::new(|_| {}));
        store.take_part(part("+1", 0, "a", None), SmsState::Received).unwrap();
        let err = store.take_part(part("+1", 0, "b", None), SmsState::Received).unwrap_err();
        assert_eq!(err, crate::error::CoreError::AlreadyExists.into());
    }

    #[test]
    fn multipart_reassembles_and_emits_added_once() {
        let events = std::rc::Rc::new(std::cell::RefCell::new(Vec::new()));
        let events_clone = events.clone();
        let mut store = SmsPartStore::new(Box::new(move |event| events_clone.borrow_mut().push(event)));

        let mp = |seq| Some(MultipartInfo { reference: 42, max: 2, sequence: seq });
        let path1 = store.take_part(part("+12025551212", 0, "Hello ", mp(1)), SmsState::Receiving).unwrap();

        assert_eq!(events.borrow().as_slice(), &[StoreEvent::Added { path: path1, is_receive: true }]);
        let sms = store.get(path1).unwrap();
        assert!(matches!(&sms.body, SmsBody::Multipart { state: SmsState::Receiving, .. }));

        let path2 = store.take_part(part("+12025551212", 1, "world", mp(2)), SmsState::Receiving).unwrap();
        assert_eq!(path1, path2);

        // no second `added` for the same path
        assert_eq!(events.borrow().len(), 1);

        let sms = store.get(path1).unwrap();
        assert!(matches!(&sms.body, SmsBody::Multipart { state: SmsState::Received, .. }));
        assert_eq!(sms.text(), "Hello world");
    }

    #[test]
    fn max_one_multipart_goes_straight_to_received() {
        let mut store = SmsPartStore::new(Box::new(|_| {}));
        let mp = MultipartInfo { reference: 7, max: 1, sequence: 1 };
        let path = store.take_part(part("+1", 0, "solo", Some(mp)), SmsState::Receiving).unwrap();
        let sms = store.get(path).unwrap();
        assert!(matches!(&sms.body, SmsBody::Multipart { state: SmsState::Received, .. }));
    }

    #[test]
    fn local_multipart_reference_lookup_matches_submit_only() {
        let mut store = SmsPartStore::new(Box::new(|_| {}));
        let mut submit_part = part("+12025551212", 0, "out", Some(MultipartInfo { reference: 9, max: 2, sequence: 1 }));
        submit_part.pdu_type = PduType::Submit;
        submit_part.index = None;
        store.take_part(submit_part, SmsState::Sending).unwrap();

        assert!(store.has_local_multipart_reference("+12025551212", 9));
        assert!(!store.has_local_multipart_reference("+12025551212", 10));
        assert!(!store.has_local_multipart_reference("+10000000000", 9));
    }
}
