use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::model::Event;

/// No single event comes close; a larger prefix is garbage.
const MAX_RECORD_LEN: usize = 64 * 1024 * 1024;

/// Write one record: `[u32 len][bincode Event][u32 crc32]`, little endian.
fn encode_event(writer: &mut impl Write, event: &Event) -> io::Result<()> {
    let payload =
        bincode::serialize(event).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "WAL record too large"))?;
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc32fast::hash(&payload).to_le_bytes())?;
    Ok(())
}

enum Record {
    Event(Event),
    /// Clean end of file.
    End,
    /// Partial or corrupt record. Everything from here on is dropped.
    Torn(&'static str),
}

/// Fill `buf` completely, or report how many bytes were there before EOF.
fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

fn read_record(reader: &mut impl Read) -> io::Result<Record> {
    let mut len_buf = [0u8; 4];
    match read_full(reader, &mut len_buf)? {
        0 => return Ok(Record::End),
        4 => {}
        _ => return Ok(Record::Torn("truncated length prefix")),
    }
    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_RECORD_LEN {
        return Ok(Record::Torn("oversized record"));
    }

    let mut payload = vec![0u8; len];
    if read_full(reader, &mut payload)? < len {
        return Ok(Record::Torn("truncated payload"));
    }
    let mut crc_buf = [0u8; 4];
    if read_full(reader, &mut crc_buf)? < 4 {
        return Ok(Record::Torn("truncated checksum"));
    }
    if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
        return Ok(Record::Torn("checksum mismatch"));
    }
    match bincode::deserialize::<Event>(&payload) {
        Ok(event) => Ok(Record::Event(event)),
        Err(_) => Ok(Record::Torn("undecodable payload")),
    }
}

/// Append-only log of every state change of one tenant.
///
/// A crash mid-append leaves a torn last record; replay stops there and the
/// engine rebuilds from everything before it.
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    appends_since_compact: u64,
}

impl Wal {
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            appends_since_compact: 0,
        })
    }

    /// Append and fsync one event. The writer task batches instead.
    #[cfg(test)]
    pub fn append(&mut self, event: &Event) -> io::Result<()> {
        self.append_buffered(event)?;
        self.flush_sync()
    }

    /// Buffer one event. Not durable until `flush_sync`.
    pub fn append_buffered(&mut self, event: &Event) -> io::Result<()> {
        encode_event(&mut self.writer, event)?;
        self.appends_since_compact += 1;
        Ok(())
    }

    pub fn flush_sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn compact_path(path: &Path) -> PathBuf {
        path.with_extension("wal.tmp")
    }

    /// Write the compacted event set next to the log and fsync it.
    pub fn write_compact_file(path: &Path, events: &[Event]) -> io::Result<()> {
        let mut writer = BufWriter::new(File::create(Self::compact_path(path))?);
        for event in events {
            encode_event(&mut writer, event)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()
    }

    /// Rename the compacted file over the log and reopen it for appends.
    pub fn swap_compact_file(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        fs::rename(Self::compact_path(&self.path), &self.path)?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        self.writer = BufWriter::new(file);
        self.appends_since_compact = 0;
        Ok(())
    }

    #[cfg(test)]
    pub fn compact(&mut self, events: &[Event]) -> io::Result<()> {
        Self::write_compact_file(&self.path, events)?;
        self.swap_compact_file()
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    /// Every intact event in the log, in append order. A missing file is an
    /// empty log.
    pub fn replay(path: &Path) -> io::Result<Vec<Event>> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut reader = BufReader::new(file);
        let mut events = Vec::new();
        loop {
            match read_record(&mut reader)? {
                Record::Event(event) => events.push(event),
                Record::End => break,
                Record::Torn(reason) => {
                    warn!(
                        "{}: discarding WAL tail after {} events ({reason})",
                        path.display(),
                        events.len()
                    );
                    break;
                }
            }
        }
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DateRange, Location, Reservation, SpaceListing, UserProfile, Window};
    use chrono::NaiveDate;
    use ulid::Ulid;

    fn tmp_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("flexdesk_test_wal");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = fs::remove_file(&path);
        path
    }

    fn space_created(title: &str) -> Event {
        Event::SpaceCreated {
            id: Ulid::new(),
            listing: SpaceListing {
                title: title.into(),
                description: String::new(),
                address: "12 Calle Luna".into(),
                location: Location {
                    latitude: 40.4,
                    longitude: -3.7,
                },
                capacity: 2,
                price_per_day: 35,
                image_url: None,
            },
        }
    }

    fn booked(space_id: Ulid, user_id: Ulid, day: u32) -> Event {
        let date = NaiveDate::from_ymd_opt(2024, 3, day).unwrap();
        Event::ReservationBooked {
            reservation: Reservation {
                id: Ulid::new(),
                space_id,
                user_id,
                window: Window::whole_days(DateRange::single(date)),
                details: Some("client visit".into()),
                total_price: 35,
                created_at: 1_000,
                cancellation_deadline: 2_000,
            },
        }
    }

    #[test]
    fn append_and_replay() {
        let path = tmp_path("append_and_replay.wal");
        let space = space_created("Studio");
        let Event::SpaceCreated { id: space_id, .. } = space else {
            unreachable!()
        };
        let user_id = Ulid::new();
        let events = vec![
            space.clone(),
            Event::UserCreated {
                id: user_id,
                profile: UserProfile {
                    name: "Lu".into(),
                    email: "lu@example.com".into(),
                    admin: true,
                },
            },
            booked(space_id, user_id, 4),
        ];

        {
            let mut wal = Wal::open(&path).unwrap();
            for e in &events {
                wal.append(e).unwrap();
            }
        }

        assert_eq!(Wal::replay(&path).unwrap(), events);
    }

    #[test]
    fn replay_drops_torn_tail() {
        let path = tmp_path("torn_tail.wal");
        let event = space_created("Studio");
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&event).unwrap();
        }
        // A crash halfway through the next record.
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[42, 0, 0, 0, 1, 2]).unwrap();
        }

        assert_eq!(Wal::replay(&path).unwrap(), vec![event]);
    }

    #[test]
    fn replay_drops_short_length_prefix() {
        let path = tmp_path("short_prefix.wal");
        let event = Event::UserDeleted { id: Ulid::new() };
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&event).unwrap();
        }
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[7, 0]).unwrap();
        }
        assert_eq!(Wal::replay(&path).unwrap(), vec![event]);
    }

    #[test]
    fn replay_missing_file_is_empty() {
        let path = tmp_path("missing.wal");
        assert!(Wal::replay(&path).unwrap().is_empty());
    }

    #[test]
    fn replay_stops_at_bad_checksum() {
        let path = tmp_path("bad_crc.wal");
        let good = Event::SpaceDeleted { id: Ulid::new() };
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&good).unwrap();
        }
        {
            let payload = bincode::serialize(&Event::UserDeleted { id: Ulid::new() }).unwrap();
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&(payload.len() as u32).to_le_bytes()).unwrap();
            f.write_all(&payload).unwrap();
            f.write_all(&0xDEAD_BEEFu32.to_le_bytes()).unwrap();
        }
        // Anything after a bad record is ignored too.
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&Event::SpaceDeleted { id: Ulid::new() }).unwrap();
        }

        assert_eq!(Wal::replay(&path).unwrap(), vec![good]);
    }

    #[test]
    fn compact_shrinks_churned_log() {
        let path = tmp_path("compact_shrink.wal");
        let space = space_created("Loft");
        let Event::SpaceCreated { id: space_id, .. } = space else {
            unreachable!()
        };
        let user_id = Ulid::new();

        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&space).unwrap();
            for day in 1..=10 {
                let event = booked(space_id, user_id, day);
                let Event::ReservationBooked { reservation } = &event else {
                    unreachable!()
                };
                let cancelled = Event::ReservationCancelled {
                    id: reservation.id,
                    space_id,
                    user_id,
                };
                wal.append(&event).unwrap();
                wal.append(&cancelled).unwrap();
            }
            assert_eq!(wal.appends_since_compact(), 21);
        }
        let before = fs::metadata(&path).unwrap().len();

        let mut wal = Wal::open(&path).unwrap();
        wal.compact(std::slice::from_ref(&space)).unwrap();
        assert_eq!(wal.appends_since_compact(), 0);

        let after = fs::metadata(&path).unwrap().len();
        assert!(after < before, "compacted WAL should shrink: {after} < {before}");
        assert_eq!(Wal::replay(&path).unwrap(), vec![space]);
        assert!(!Wal::compact_path(&path).exists());
    }

    #[test]
    fn appends_after_compaction_land_in_new_log() {
        let path = tmp_path("compact_then_append.wal");
        let space = space_created("Loft");
        let Event::SpaceCreated { id: space_id, .. } = space else {
            unreachable!()
        };
        let later = booked(space_id, Ulid::new(), 9);

        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&space).unwrap();
            wal.append(&Event::SpaceUpdated {
                id: space_id,
                listing: match &space {
                    Event::SpaceCreated { listing, .. } => listing.clone(),
                    _ => unreachable!(),
                },
            })
            .unwrap();
            wal.compact(std::slice::from_ref(&space)).unwrap();
            wal.append(&later).unwrap();
        }

        assert_eq!(Wal::replay(&path).unwrap(), vec![space, later]);
    }

    #[test]
    fn buffered_appends_need_flush() {
        let path = tmp_path("buffered.wal");
        let events: Vec<Event> = (0..5).map(|i| space_created(&format!("Desk {i}"))).collect();

        let mut wal = Wal::open(&path).unwrap();
        for e in &events {
            wal.append_buffered(e).unwrap();
        }
        assert_eq!(wal.appends_since_compact(), 5);
        wal.flush_sync().unwrap();

        assert_eq!(Wal::replay(&path).unwrap(), events);
    }
}
