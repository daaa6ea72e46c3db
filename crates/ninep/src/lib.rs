//! 9P2000 wire framing.
//!
//! Messages are `size[4] type[1] tag[2] payload` with little-endian
//! integers and `len[2]`-prefixed UTF-8 strings, per the 9P2000 manual.
//! Only the fcalls the synthetic editor filesystem serves are modeled;
//! anything else decodes to [`Fcall::Unknown`] so servers can answer
//! `Rerror` without dropping the connection.

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const VERSION_9P2000: &str = "9P2000";

pub const NOTAG: u16 = 0xFFFF;
pub const NOFID: u32 = 0xFFFF_FFFF;

// Qid type bits.
pub const QTDIR: u8 = 0x80;
pub const QTAPPEND: u8 = 0x40;
pub const QTFILE: u8 = 0x00;

// Dir mode bits.
pub const DMDIR: u32 = 0x8000_0000;
pub const DMAPPEND: u32 = 0x4000_0000;

// Open modes.
pub const OREAD: u8 = 0;
pub const OWRITE: u8 = 1;
pub const ORDWR: u8 = 2;
pub const OEXEC: u8 = 3;
pub const OTRUNC: u8 = 0x10;
pub const OCEXEC: u8 = 0x20;
pub const ORCLOSE: u8 = 0x40;

/// Refuse to buffer absurd frames; real clients negotiate ~8 KiB msize.
const MAX_MESSAGE_SIZE: u32 = 1 << 20;

mod kind {
    pub const TVERSION: u8 = 100;
    pub const RVERSION: u8 = 101;
    pub const TAUTH: u8 = 102;
    pub const RAUTH: u8 = 103;
    pub const TATTACH: u8 = 104;
    pub const RATTACH: u8 = 105;
    pub const RERROR: u8 = 107;
    pub const TWALK: u8 = 110;
    pub const RWALK: u8 = 111;
    pub const TOPEN: u8 = 112;
    pub const ROPEN: u8 = 113;
    pub const TREAD: u8 = 116;
    pub const RREAD: u8 = 117;
    pub const TWRITE: u8 = 118;
    pub const RWRITE: u8 = 119;
    pub const TCLUNK: u8 = 120;
    pub const RCLUNK: u8 = 121;
    pub const TSTAT: u8 = 124;
    pub const RSTAT: u8 = 125;
}

#[derive(Debug, Error)]
pub enum NineError {
    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),
    #[error("message truncated")]
    Truncated,
    #[error("message size {0} outside protocol bounds")]
    BadSize(u32),
    #[error("string field is not valid utf-8")]
    BadString,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Qid {
    pub path: u64,
    pub version: u32,
    pub qtype: u8,
}

/// A 9P stat record. `encode` produces the `size[2]`-prefixed wire form
/// used both in directory reads and `Rstat`.
#[derive(Debug, Clone, Default)]
pub struct Dir {
    pub dtype: u16,
    pub dev: u32,
    pub qid: Qid,
    pub mode: u32,
    pub atime: u32,
    pub mtime: u32,
    pub length: u64,
    pub name: String,
    pub uid: String,
    pub gid: String,
    pub muid: String,
}

impl Dir {
    pub fn encode(&self) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(&self.dtype.to_le_bytes());
        body.extend_from_slice(&self.dev.to_le_bytes());
        put_qid(&mut body, &self.qid);
        body.extend_from_slice(&self.mode.to_le_bytes());
        body.extend_from_slice(&self.atime.to_le_bytes());
        body.extend_from_slice(&self.mtime.to_le_bytes());
        body.extend_from_slice(&self.length.to_le_bytes());
        put_string(&mut body, &self.name);
        put_string(&mut body, &self.uid);
        put_string(&mut body, &self.gid);
        put_string(&mut body, &self.muid);

        let mut encoded = Vec::with_capacity(body.len() + 2);
        encoded.extend_from_slice(&(body.len() as u16).to_le_bytes());
        encoded.extend_from_slice(&body);
        encoded
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fcall {
    Tversion { tag: u16, msize: u32, version: String },
    Rversion { tag: u16, msize: u32, version: String },
    Tauth { tag: u16, afid: u32, uname: String, aname: String },
    Rauth { tag: u16, aqid: Qid },
    Tattach { tag: u16, fid: u32, afid: u32, uname: String, aname: String },
    Rattach { tag: u16, qid: Qid },
    Rerror { tag: u16, ename: String },
    Twalk { tag: u16, fid: u32, newfid: u32, wnames: Vec<String> },
    Rwalk { tag: u16, wqids: Vec<Qid> },
    Topen { tag: u16, fid: u32, mode: u8 },
    Ropen { tag: u16, qid: Qid, iounit: u32 },
    Tread { tag: u16, fid: u32, offset: u64, count: u32 },
    Rread { tag: u16, data: Vec<u8> },
    Twrite { tag: u16, fid: u32, offset: u64, data: Vec<u8> },
    Rwrite { tag: u16, count: u32 },
    Tclunk { tag: u16, fid: u32 },
    Rclunk { tag: u16 },
    Tstat { tag: u16, fid: u32 },
    Rstat { tag: u16, stat: Vec<u8> },
    /// A structurally valid message of a type this server does not speak.
    Unknown { tag: u16, message_type: u8 },
}

impl Fcall {
    pub fn tag(&self) -> u16 {
        match self {
            Fcall::Tversion { tag, .. }
            | Fcall::Rversion { tag, .. }
            | Fcall::Tauth { tag, .. }
            | Fcall::Rauth { tag, .. }
            | Fcall::Tattach { tag, .. }
            | Fcall::Rattach { tag, .. }
            | Fcall::Rerror { tag, .. }
            | Fcall::Twalk { tag, .. }
            | Fcall::Rwalk { tag, .. }
            | Fcall::Topen { tag, .. }
            | Fcall::Ropen { tag, .. }
            | Fcall::Tread { tag, .. }
            | Fcall::Rread { tag, .. }
            | Fcall::Twrite { tag, .. }
            | Fcall::Rwrite { tag, .. }
            | Fcall::Tclunk { tag, .. }
            | Fcall::Rclunk { tag }
            | Fcall::Tstat { tag, .. }
            | Fcall::Rstat { tag, .. }
            | Fcall::Unknown { tag, .. } => *tag,
        }
    }
}

/// Read one fcall from an async stream.
pub async fn read_fcall<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Fcall, NineError> {
    let mut size_bytes = [0u8; 4];
    reader.read_exact(&mut size_bytes).await?;
    let size = u32::from_le_bytes(size_bytes);
    if !(7..=MAX_MESSAGE_SIZE).contains(&size) {
        return Err(NineError::BadSize(size));
    }
    let mut body = vec![0u8; size as usize - 4];
    reader.read_exact(&mut body).await?;
    decode(&body)
}

/// Write one fcall to an async stream.
pub async fn write_fcall<W: AsyncWrite + Unpin>(
    writer: &mut W,
    fcall: &Fcall,
) -> Result<(), NineError> {
    let encoded = encode(fcall);
    writer.write_all(&encoded).await?;
    writer.flush().await?;
    Ok(())
}

pub fn encode(fcall: &Fcall) -> Vec<u8> {
    let mut body = Vec::new();
    let message_type = match fcall {
        Fcall::Tversion { tag, msize, version } => {
            body.extend_from_slice(&tag.to_le_bytes());
            body.extend_from_slice(&msize.to_le_bytes());
            put_string(&mut body, version);
            kind::TVERSION
        }
        Fcall::Rversion { tag, msize, version } => {
            body.extend_from_slice(&tag.to_le_bytes());
            body.extend_from_slice(&msize.to_le_bytes());
            put_string(&mut body, version);
            kind::RVERSION
        }
        Fcall::Tauth { tag, afid, uname, aname } => {
            body.extend_from_slice(&tag.to_le_bytes());
            body.extend_from_slice(&afid.to_le_bytes());
            put_string(&mut body, uname);
            put_string(&mut body, aname);
            kind::TAUTH
        }
        Fcall::Rauth { tag, aqid } => {
            body.extend_from_slice(&tag.to_le_bytes());
            put_qid(&mut body, aqid);
            kind::RAUTH
        }
        Fcall::Tattach { tag, fid, afid, uname, aname } => {
            body.extend_from_slice(&tag.to_le_bytes());
            body.extend_from_slice(&fid.to_le_bytes());
            body.extend_from_slice(&afid.to_le_bytes());
            put_string(&mut body, uname);
            put_string(&mut body, aname);
            kind::TATTACH
        }
        Fcall::Rattach { tag, qid } => {
            body.extend_from_slice(&tag.to_le_bytes());
            put_qid(&mut body, qid);
            kind::RATTACH
        }
        Fcall::Rerror { tag, ename } => {
            body.extend_from_slice(&tag.to_le_bytes());
            put_string(&mut body, ename);
            kind::RERROR
        }
        Fcall::Twalk { tag, fid, newfid, wnames } => {
            body.extend_from_slice(&tag.to_le_bytes());
            body.extend_from_slice(&fid.to_le_bytes());
            body.extend_from_slice(&newfid.to_le_bytes());
            body.extend_from_slice(&(wnames.len() as u16).to_le_bytes());
            for name in wnames {
                put_string(&mut body, name);
            }
            kind::TWALK
        }
        Fcall::Rwalk { tag, wqids } => {
            body.extend_from_slice(&tag.to_le_bytes());
            body.extend_from_slice(&(wqids.len() as u16).to_le_bytes());
            for qid in wqids {
                put_qid(&mut body, qid);
            }
            kind::RWALK
        }
        Fcall::Topen { tag, fid, mode } => {
            body.extend_from_slice(&tag.to_le_bytes());
            body.extend_from_slice(&fid.to_le_bytes());
            body.push(*mode);
            kind::TOPEN
        }
        Fcall::Ropen { tag, qid, iounit } => {
            body.extend_from_slice(&tag.to_le_bytes());
            put_qid(&mut body, qid);
            body.extend_from_slice(&iounit.to_le_bytes());
            kind::ROPEN
        }
        Fcall::Tread { tag, fid, offset, count } => {
            body.extend_from_slice(&tag.to_le_bytes());
            body.extend_from_slice(&fid.to_le_bytes());
            body.extend_from_slice(&offset.to_le_bytes());
            body.extend_from_slice(&count.to_le_bytes());
            kind::TREAD
        }
        Fcall::Rread { tag, data } => {
            body.extend_from_slice(&tag.to_le_bytes());
            body.extend_from_slice(&(data.len() as u32).to_le_bytes());
            body.extend_from_slice(data);
            kind::RREAD
        }
        Fcall::Twrite { tag, fid, offset, data } => {
            body.extend_from_slice(&tag.to_le_bytes());
            body.extend_from_slice(&fid.to_le_bytes());
            body.extend_from_slice(&offset.to_le_bytes());
            body.extend_from_slice(&(data.len() as u32).to_le_bytes());
            body.extend_from_slice(data);
            kind::TWRITE
        }
        Fcall::Rwrite { tag, count } => {
            body.extend_from_slice(&tag.to_le_bytes());
            body.extend_from_slice(&count.to_le_bytes());
            kind::RWRITE
        }
        Fcall::Tclunk { tag, fid } => {
            body.extend_from_slice(&tag.to_le_bytes());
            body.extend_from_slice(&fid.to_le_bytes());
            kind::TCLUNK
        }
        Fcall::Rclunk { tag } => {
            body.extend_from_slice(&tag.to_le_bytes());
            kind::RCLUNK
        }
        Fcall::Tstat { tag, fid } => {
            body.extend_from_slice(&tag.to_le_bytes());
            body.extend_from_slice(&fid.to_le_bytes());
            kind::TSTAT
        }
        Fcall::Rstat { tag, stat } => {
            body.extend_from_slice(&tag.to_le_bytes());
            body.extend_from_slice(&(stat.len() as u16).to_le_bytes());
            body.extend_from_slice(stat);
            kind::RSTAT
        }
        Fcall::Unknown { tag, message_type } => {
            body.extend_from_slice(&tag.to_le_bytes());
            *message_type
        }
    };

    let size = (body.len() + 5) as u32;
    let mut encoded = Vec::with_capacity(size as usize);
    encoded.extend_from_slice(&size.to_le_bytes());
    encoded.push(message_type);
    encoded.extend_from_slice(&body);
    encoded
}

pub fn decode(body: &[u8]) -> Result<Fcall, NineError> {
    let mut cursor = Cursor { body, position: 0 };
    let message_type = cursor.u8()?;
    let tag = cursor.u16()?;
    let fcall = match message_type {
        kind::TVERSION => Fcall::Tversion {
            tag,
            msize: cursor.u32()?,
            version: cursor.string()?,
        },
        kind::RVERSION => Fcall::Rversion {
            tag,
            msize: cursor.u32()?,
            version: cursor.string()?,
        },
        kind::TAUTH => Fcall::Tauth {
            tag,
            afid: cursor.u32()?,
            uname: cursor.string()?,
            aname: cursor.string()?,
        },
        kind::RAUTH => Fcall::Rauth {
            tag,
            aqid: cursor.qid()?,
        },
        kind::TATTACH => Fcall::Tattach {
            tag,
            fid: cursor.u32()?,
            afid: cursor.u32()?,
            uname: cursor.string()?,
            aname: cursor.string()?,
        },
        kind::RATTACH => Fcall::Rattach {
            tag,
            qid: cursor.qid()?,
        },
        kind::RERROR => Fcall::Rerror {
            tag,
            ename: cursor.string()?,
        },
        kind::TWALK => {
            let fid = cursor.u32()?;
            let newfid = cursor.u32()?;
            let count = cursor.u16()?;
            let mut wnames = Vec::with_capacity(count as usize);
            for _ in 0..count {
                wnames.push(cursor.string()?);
            }
            Fcall::Twalk {
                tag,
                fid,
                newfid,
                wnames,
            }
        }
        kind::RWALK => {
            let count = cursor.u16()?;
            let mut wqids = Vec::with_capacity(count as usize);
            for _ in 0..count {
                wqids.push(cursor.qid()?);
            }
            Fcall::Rwalk { tag, wqids }
        }
        kind::TOPEN => Fcall::Topen {
            tag,
            fid: cursor.u32()?,
            mode: cursor.u8()?,
        },
        kind::ROPEN => Fcall::Ropen {
            tag,
            qid: cursor.qid()?,
            iounit: cursor.u32()?,
        },
        kind::TREAD => Fcall::Tread {
            tag,
            fid: cursor.u32()?,
            offset: cursor.u64()?,
            count: cursor.u32()?,
        },
        kind::RREAD => {
            let count = cursor.u32()?;
            Fcall::Rread {
                tag,
                data: cursor.bytes(count as usize)?,
            }
        }
        kind::TWRITE => {
            let fid = cursor.u32()?;
            let offset = cursor.u64()?;
            let count = cursor.u32()?;
            Fcall::Twrite {
                tag,
                fid,
                offset,
                data: cursor.bytes(count as usize)?,
            }
        }
        kind::RWRITE => Fcall::Rwrite {
            tag,
            count: cursor.u32()?,
        },
        kind::TCLUNK => Fcall::Tclunk {
            tag,
            fid: cursor.u32()?,
        },
        kind::RCLUNK => Fcall::Rclunk { tag },
        kind::TSTAT => Fcall::Tstat {
            tag,
            fid: cursor.u32()?,
        },
        kind::RSTAT => {
            let count = cursor.u16()?;
            Fcall::Rstat {
                tag,
                stat: cursor.bytes(count as usize)?,
            }
        }
        other => Fcall::Unknown {
            tag,
            message_type: other,
        },
    };
    Ok(fcall)
}

fn put_string(out: &mut Vec<u8>, value: &str) {
    out.extend_from_slice(&(value.len() as u16).to_le_bytes());
    out.extend_from_slice(value.as_bytes());
}

fn put_qid(out: &mut Vec<u8>, qid: &Qid) {
    out.push(qid.qtype);
    out.extend_from_slice(&qid.version.to_le_bytes());
    out.extend_from_slice(&qid.path.to_le_bytes());
}

struct Cursor<'a> {
    body: &'a [u8],
    position: usize,
}

impl Cursor<'_> {
    fn bytes(&mut self, count: usize) -> Result<Vec<u8>, NineError> {
        let end = self
            .position
            .checked_add(count)
            .filter(|end| *end <= self.body.len())
            .ok_or(NineError::Truncated)?;
        let slice = self.body[self.position..end].to_vec();
        self.position = end;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, NineError> {
        Ok(self.bytes(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, NineError> {
        let bytes = self.bytes(2)?;
        Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    fn u32(&mut self) -> Result<u32, NineError> {
        let bytes = self.bytes(4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn u64(&mut self) -> Result<u64, NineError> {
        let bytes = self.bytes(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&bytes);
        Ok(u64::from_le_bytes(raw))
    }

    fn string(&mut self) -> Result<String, NineError> {
        let length = self.u16()?;
        let bytes = self.bytes(length as usize)?;
        String::from_utf8(bytes).map_err(|_| NineError::BadString)
    }

    fn qid(&mut self) -> Result<Qid, NineError> {
        let qtype = self.u8()?;
        let version = self.u32()?;
        let path = self.u64()?;
        Ok(Qid {
            path,
            version,
            qtype,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(fcall: Fcall) {
        let encoded = encode(&fcall);
        let size = u32::from_le_bytes([encoded[0], encoded[1], encoded[2], encoded[3]]);
        assert_eq!(size as usize, encoded.len());
        let decoded = decode(&encoded[4..]).expect("decode should succeed");
        assert_eq!(decoded, fcall);
    }

    #[test]
    fn fcalls_round_trip() {
        round_trip(Fcall::Tversion {
            tag: NOTAG,
            msize: 8192,
            version: VERSION_9P2000.to_string(),
        });
        round_trip(Fcall::Tauth {
            tag: 1,
            afid: 7,
            uname: "glenda".to_string(),
            aname: String::new(),
        });
        round_trip(Fcall::Twalk {
            tag: 2,
            fid: 1,
            newfid: 2,
            wnames: vec!["3".to_string(), "body".to_string()],
        });
        round_trip(Fcall::Rwalk {
            tag: 2,
            wqids: vec![Qid {
                path: 0x0300_0000_0001,
                version: 4,
                qtype: QTDIR,
            }],
        });
        round_trip(Fcall::Twrite {
            tag: 3,
            fid: 2,
            offset: 16,
            data: b"hello".to_vec(),
        });
        round_trip(Fcall::Rread {
            tag: 4,
            data: vec![0, 1, 2, 3],
        });
        round_trip(Fcall::Rerror {
            tag: 5,
            ename: "permission denied".to_string(),
        });
    }

    #[test]
    fn unknown_type_preserves_tag() {
        let fcall = decode(&[13, 42, 0]).expect("unknown type still decodes");
        assert_eq!(
            fcall,
            Fcall::Unknown {
                tag: 42,
                message_type: 13
            }
        );
    }

    #[test]
    fn truncated_message_is_an_error() {
        // Twalk claiming one name but carrying none.
        let mut body = vec![kind::TWALK];
        body.extend_from_slice(&1u16.to_le_bytes());
        body.extend_from_slice(&1u32.to_le_bytes());
        body.extend_from_slice(&2u32.to_le_bytes());
        body.extend_from_slice(&1u16.to_le_bytes());
        assert!(matches!(decode(&body), Err(NineError::Truncated)));
    }

    #[test]
    fn dir_encoding_is_self_sized() {
        let dir = Dir {
            dtype: 0,
            dev: 0,
            qid: Qid {
                path: 1,
                version: 0,
                qtype: QTFILE,
            },
            mode: 0o600,
            atime: 100,
            mtime: 100,
            length: 0,
            name: "body".to_string(),
            uid: "1000".to_string(),
            gid: "1000".to_string(),
            muid: "1000".to_string(),
        };
        let encoded = dir.encode();
        let declared = u16::from_le_bytes([encoded[0], encoded[1]]) as usize;
        assert_eq!(declared + 2, encoded.len());
    }

    #[tokio::test]
    async fn async_read_write_round_trip() {
        let fcall = Fcall::Ropen {
            tag: 9,
            qid: Qid {
                path: 3,
                version: 1,
                qtype: QTAPPEND,
            },
            iounit: 0,
        };
        let mut buffer = Vec::new();
        write_fcall(&mut buffer, &fcall).await.unwrap();
        let mut reader = buffer.as_slice();
        let decoded = read_fcall(&mut reader).await.unwrap();
        assert_eq!(decoded, fcall);
    }
}
