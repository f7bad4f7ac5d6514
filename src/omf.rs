use indexmap::IndexMap;

/// The opaque sink the emitter drives. One implementation serializes MPW
/// object records; tests substitute recording sinks.
pub trait ObjectSink {
    fn putfirst(&mut self);
    fn putlast(&mut self);
    fn putcomment(&mut self, text: &str);
    fn putdict(&mut self, names: &[String]);
    fn putmod(&mut self, name: &str, flags: u8);
    fn putsize(&mut self, size: u32);
    fn putcontents(&mut self, bytes: &[u8]);
    fn putentry(&mut self, offset: u32, name: &str);
    fn putsimpleref(&mut self, name: &str, width: u8, offset: u32);
    fn putweirdref(&mut self, name: &str, width: u8, offset: u32);
}

pub const REC_FIRST: u8 = 1;
pub const REC_LAST: u8 = 2;
pub const REC_COMMENT: u8 = 3;
pub const REC_DICT: u8 = 4;
pub const REC_MODULE: u8 = 5;
pub const REC_ENTRY: u8 = 6;
pub const REC_SIZE: u8 = 7;
pub const REC_CONTENTS: u8 = 8;
pub const REC_REFERENCE: u8 = 9;

const OBJ_VERSION: u16 = 1;
/// Reference-record flag bits.
const REF_FLAG_LONG: u8 = 0x01;
const REF_FLAG_WEIRD: u8 = 0x10;

/// The companion file-type/creator descriptor written beside each object.
pub const DESCRIPTOR: &[u8; 8] = b"OBJ MPS ";

/// Serializes sink calls into MPW-style object records. Names are interned
/// into dictionary IDs in first-use order; records are even-padded.
#[derive(Debug, Default)]
pub struct MpwObject {
    buf: Vec<u8>,
    ids: IndexMap<String, u16>,
}

impl MpwObject {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn finish(self) -> Vec<u8> {
        self.buf
    }

    fn pad_even(&mut self) {
        if self.buf.len() % 2 == 1 {
            self.buf.push(0);
        }
    }

    fn id_of(&mut self, name: &str) -> u16 {
        if let Some(&id) = self.ids.get(name) {
            return id;
        }
        let id = (self.ids.len() + 1) as u16;
        self.ids.insert(name.to_string(), id);
        id
    }

    fn put_ref(&mut self, name: &str, width: u8, offset: u32, weird: bool) {
        let id = self.id_of(name);
        let mut flags = if width == 4 { REF_FLAG_LONG } else { 0 };
        if weird {
            flags |= REF_FLAG_WEIRD;
        }
        self.buf.extend_from_slice(&[REC_REFERENCE, flags]);
        self.buf.extend_from_slice(&id.to_be_bytes());
        self.buf.extend_from_slice(&offset.to_be_bytes());
    }
}

impl ObjectSink for MpwObject {
    fn putfirst(&mut self) {
        self.buf.extend_from_slice(&[REC_FIRST, 0]);
        self.buf.extend_from_slice(&OBJ_VERSION.to_be_bytes());
    }

    fn putlast(&mut self) {
        self.buf.extend_from_slice(&[REC_LAST, 0]);
    }

    fn putcomment(&mut self, text: &str) {
        self.buf.extend_from_slice(&[REC_COMMENT, 0]);
        let bytes = text.as_bytes();
        self.buf
            .extend_from_slice(&(bytes.len().min(u16::MAX as usize) as u16).to_be_bytes());
        self.buf
            .extend_from_slice(&bytes[..bytes.len().min(u16::MAX as usize)]);
        self.pad_even();
    }

    fn putdict(&mut self, names: &[String]) {
        let fresh: Vec<&String> = names.iter().filter(|n| !self.ids.contains_key(*n)).collect();
        if fresh.is_empty() {
            return;
        }
        let first_id = (self.ids.len() + 1) as u16;
        self.buf.extend_from_slice(&[REC_DICT, 0]);
        self.buf.extend_from_slice(&first_id.to_be_bytes());
        self.buf
            .extend_from_slice(&(fresh.len() as u16).to_be_bytes());
        for name in fresh {
            let id = (self.ids.len() + 1) as u16;
            self.ids.insert(name.clone(), id);
            let bytes = name.as_bytes();
            self.buf.push(bytes.len().min(255) as u8);
            self.buf.extend_from_slice(&bytes[..bytes.len().min(255)]);
        }
        self.pad_even();
    }

    fn putmod(&mut self, name: &str, flags: u8) {
        let id = self.id_of(name);
        self.buf.extend_from_slice(&[REC_MODULE, flags]);
        self.buf.extend_from_slice(&id.to_be_bytes());
    }

    fn putsize(&mut self, size: u32) {
        self.buf.extend_from_slice(&[REC_SIZE, 0]);
        self.buf.extend_from_slice(&size.to_be_bytes());
    }

    fn putcontents(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(&[REC_CONTENTS, 0]);
        self.buf
            .extend_from_slice(&(bytes.len() as u32).to_be_bytes());
        self.buf.extend_from_slice(bytes);
        self.pad_even();
    }

    fn putentry(&mut self, offset: u32, name: &str) {
        let id = self.id_of(name);
        self.buf.extend_from_slice(&[REC_ENTRY, 0]);
        self.buf.extend_from_slice(&id.to_be_bytes());
        self.buf.extend_from_slice(&offset.to_be_bytes());
    }

    fn putsimpleref(&mut self, name: &str, width: u8, offset: u32) {
        self.put_ref(name, width, offset, false);
    }

    fn putweirdref(&mut self, name: &str, width: u8, offset: u32) {
        self.put_ref(name, width, offset, true);
    }
}
