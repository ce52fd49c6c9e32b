/*! Parser for the OLE Compound File Binary Format (CFB).

Read more about the format here:
  https://learn.microsoft.com/en-us/openspecs/windows_protocols/ms-cfb/53989ce4-7b05-4f8d-829b-d08d6148375b

Every offset and sector number in a compound file is controlled by whoever
built it. All reads go through [`slice::get`] with checked arithmetic, and
every chain walked through the FAT, mini FAT, DIFAT or the directory tree is
bounded, so a loop in any of them ends the parse with an error.
*/
use nom::{
    bytes::complete::take,
    combinator::verify,
    multi::count,
    number::complete::{le_u16, le_u32, le_u64, le_u8},
    sequence::tuple,
    IResult,
};
use rustc_hash::FxHashSet;
use thiserror::Error;

use crate::models::decode_utf16_lossy;

pub(crate) const OLECF_SIGNATURE: &[u8] =
    &[0xD0, 0xCF, 0x11, 0xE0, 0xA1, 0xB1, 0x1A, 0xE1];

const HEADER_SIZE: usize = 512;
const HEADER_DIFAT_ENTRIES: usize = 109;
const DIRECTORY_ENTRY_SIZE: usize = 128;
const MINI_SECTOR_SHIFT: u16 = 6;
const MINI_STREAM_CUTOFF: u32 = 4096;

// Directory entry types
const STORAGE_TYPE: u8 = 1;
const STREAM_TYPE: u8 = 2;
const ROOT_STORAGE_TYPE: u8 = 5;

// Special sectors
const MAX_REGULAR_SECTOR: u32 = 0xFFFFFFFA;
const ENDOFCHAIN: u32 = 0xFFFFFFFE;
const FREESECT: u32 = 0xFFFFFFFF;

// Special directory entry IDs
const NOSTREAM: u32 = 0xFFFFFFFF;

/// Errors produced while parsing a compound file.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OleError {
    /// The payload doesn't start with the compound file signature.
    #[error("missing compound file signature")]
    NotOle,
    /// The header is truncated or has an invalid byte order mark.
    #[error("truncated or malformed header")]
    TruncatedHeader,
    /// Some header field has a value not allowed by the format.
    #[error("invalid header field `{field}`: {value:#x}")]
    InvalidHeader {
        /// Name of the field.
        field: &'static str,
        /// Value found in the header.
        value: u32,
    },
    /// A sector lies beyond the end of the payload.
    #[error("sector {sector} is beyond the end of the payload")]
    SectorOutOfRange {
        /// Sector number.
        sector: u32,
    },
    /// The FAT (or mini FAT) has no entry for a sector.
    #[error("allocation table has no entry for sector {sector}")]
    FatOutOfRange {
        /// Sector number.
        sector: u32,
    },
    /// A chain visits some sector twice.
    #[error("sector chain starting at {start} loops")]
    ChainLoop {
        /// First sector of the chain.
        start: u32,
    },
    /// The same sector appears twice in the list of FAT sectors.
    #[error("sector {sector} is listed twice as a FAT sector")]
    DuplicateFatSector {
        /// Sector number.
        sector: u32,
    },
    /// The directory has no root entry.
    #[error("directory has no root entry")]
    MissingRoot,
    /// A directory entry references an entry that doesn't exist.
    #[error("directory entry {entry} references missing entry {target}")]
    DirectoryOutOfRange {
        /// Entry holding the reference.
        entry: u32,
        /// Referenced entry.
        target: u32,
    },
    /// A directory entry is reachable twice.
    #[error("directory tree loops at entry {entry}")]
    DirectoryLoop {
        /// Entry reached twice.
        entry: u32,
    },
    /// The data of a stream lies beyond the end of the payload.
    #[error("stream `{name}` extends beyond the end of the payload")]
    StreamOutOfRange {
        /// Path of the stream.
        name: String,
    },
    /// A stream is larger than the caller is willing to read.
    #[error("stream `{name}` is larger than {limit} bytes")]
    StreamTooLarge {
        /// Path of the stream.
        name: String,
        /// Maximum size accepted.
        limit: u64,
    },
}

impl<I> From<nom::Err<nom::error::Error<I>>> for OleError {
    fn from(_: nom::Err<nom::error::Error<I>>) -> Self {
        OleError::TruncatedHeader
    }
}

/// Header fields needed for walking the file.
struct Header {
    major_version: u16,
    sector_shift: u16,
    mini_sector_shift: u16,
    num_fat_sectors: u32,
    first_dir_sector: u32,
    mini_stream_cutoff: u32,
    first_mini_fat_sector: u32,
    num_mini_fat_sectors: u32,
    first_difat_sector: u32,
    num_difat_sectors: u32,
    difat: Vec<u32>,
}

/// A raw entry of the directory.
pub(crate) struct DirectoryEntry {
    raw_name: Vec<u8>,
    entry_type: u8,
    left: u32,
    right: u32,
    child: u32,
    start_sector: u32,
    pub(crate) size: u64,
}

/// A stream reachable from the root of the directory tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEntry {
    /// Name as stored, UTF-16LE without the terminating null.
    pub raw_name: Vec<u8>,
    /// Name with control characters removed.
    pub name: String,
    /// Normalized names from the root down to this stream, joined by `/`.
    pub path: String,
    /// Declared size.
    pub size: u64,
    start_sector: u32,
}

impl StreamEntry {
    fn in_mini_stream(&self) -> bool {
        self.size < MINI_STREAM_CUTOFF as u64
    }
}

/// A parsed compound file.
pub struct OleFile<'a> {
    data: &'a [u8],
    major_version: u16,
    sector_size: usize,
    mini_sector_size: usize,
    /// Maximum number of sectors the payload can hold. No FAT can have
    /// more sectors than this.
    max_sectors: usize,
    fat: Vec<u32>,
    mini_fat: Vec<u32>,
    /// Sectors holding the mini stream, in order.
    mini_stream_sectors: Vec<u32>,
    mini_stream_size: u64,
    streams: Vec<StreamEntry>,
}

impl<'a> OleFile<'a> {
    /// Parses the header, allocation tables and directory of a compound
    /// file.
    ///
    /// The work done here is proportional to the size of the payload.
    /// Stream offsets are resolved later, one stream at a time, by
    /// [`OleFile::locate`].
    pub fn parse(data: &'a [u8]) -> Result<Self, OleError> {
        if !data.starts_with(OLECF_SIGNATURE) {
            return Err(OleError::NotOle);
        }
        if data.len() < HEADER_SIZE {
            return Err(OleError::TruncatedHeader);
        }

        let (_, header) = parse_header(data)?;
        validate_header(&header)?;

        let sector_size = 1_usize << header.sector_shift;
        let mut file = OleFile {
            data,
            major_version: header.major_version,
            sector_size,
            mini_sector_size: 1_usize << header.mini_sector_shift,
            max_sectors: data.len() / sector_size,
            fat: Vec::new(),
            mini_fat: Vec::new(),
            mini_stream_sectors: Vec::new(),
            mini_stream_size: 0,
            streams: Vec::new(),
        };

        file.load_fat(&header)?;

        if header.num_mini_fat_sectors > 0
            && header.first_mini_fat_sector < MAX_REGULAR_SECTOR
        {
            let chain = file.follow_chain(header.first_mini_fat_sector)?;
            for sector in chain {
                let sector = file.read_sector(sector)?;
                file.mini_fat.extend(u32_values(sector));
            }
        }

        let entries = file.read_directory(header.first_dir_sector)?;
        file.walk_directory(&entries)?;

        Ok(file)
    }

    /// Streams reachable from the root storage, in directory order.
    pub fn streams(&self) -> &[StreamEntry] {
        self.streams.as_slice()
    }

    /// Finds a stream by its path, ignoring case.
    pub fn find_stream(&self, path: &str) -> Option<&StreamEntry> {
        self.streams.iter().find(|s| s.path.eq_ignore_ascii_case(path))
    }

    /// Reads the content of a stream, refusing streams larger than `limit`.
    pub fn read_stream(
        &self,
        stream: &StreamEntry,
        limit: u64,
    ) -> Result<Vec<u8>, OleError> {
        if stream.size > limit {
            return Err(OleError::StreamTooLarge {
                name: stream.path.clone(),
                limit,
            });
        }

        let size = stream.size as usize;
        let mut data = Vec::with_capacity(size);
        let out_of_range =
            || OleError::StreamOutOfRange { name: stream.path.clone() };

        if size == 0 {
            return Ok(data);
        }

        if stream.in_mini_stream() {
            let needed = sectors_for(stream.size, self.mini_sector_size);
            for mini_sector in Chain::new(&self.mini_fat, stream.start_sector)
                .take(needed)
            {
                let mini_sector = mini_sector?;
                let len = (size - data.len()).min(self.mini_sector_size);
                let offset = self
                    .mini_sector_offset(mini_sector)
                    .map_err(|_| out_of_range())?;
                let bytes = self
                    .data
                    .get(offset..offset + len)
                    .ok_or_else(out_of_range)?;
                data.extend_from_slice(bytes);
            }
        } else {
            let needed = sectors_for(stream.size, self.sector_size);
            for sector in
                Chain::new(&self.fat, stream.start_sector).take(needed)
            {
                let sector = sector?;
                let len = (size - data.len()).min(self.sector_size);
                let offset =
                    self.sector_offset(sector).ok_or_else(out_of_range)?;
                let bytes = self
                    .data
                    .get(offset..offset + len)
                    .ok_or_else(out_of_range)?;
                data.extend_from_slice(bytes);
            }
        }

        if data.len() != size {
            return Err(out_of_range());
        }

        Ok(data)
    }

    /// Returns the offset of a regular sector, or `None` if the sector
    /// number can't be represented.
    fn sector_offset(&self, sector: u32) -> Option<usize> {
        if sector > MAX_REGULAR_SECTOR {
            return None;
        }
        // The header takes the space of sector -1.
        (sector as usize).checked_add(1)?.checked_mul(self.sector_size)
    }

    /// Returns a full sector.
    fn read_sector(&self, sector: u32) -> Result<&'a [u8], OleError> {
        let data: &'a [u8] = self.data;
        self.sector_offset(sector)
            .and_then(|offset| data.get(offset..offset + self.sector_size))
            .ok_or(OleError::SectorOutOfRange { sector })
    }

    /// Returns the payload offset of a mini sector.
    fn mini_sector_offset(&self, mini_sector: u32) -> Result<usize, OleError> {
        let out_of_range = OleError::SectorOutOfRange { sector: mini_sector };
        let mini_offset = (mini_sector as usize)
            .checked_mul(self.mini_sector_size)
            .ok_or(out_of_range.clone())?;
        if mini_offset as u64 >= self.mini_stream_size {
            return Err(out_of_range);
        }
        let sector = self
            .mini_stream_sectors
            .get(mini_offset / self.sector_size)
            .ok_or(out_of_range.clone())?;
        self.sector_offset(*sector)
            .map(|offset| offset + mini_offset % self.sector_size)
            .ok_or(out_of_range)
    }

    /// Collects the FAT sectors listed in the header and in the DIFAT
    /// chain, and loads the whole FAT.
    ///
    /// Every FAT sector must be a different sector of the payload, so the
    /// FAT is never larger than the payload itself, whatever the header
    /// says.
    fn load_fat(&mut self, header: &Header) -> Result<(), OleError> {
        let wanted = (header.num_fat_sectors as usize).min(self.max_sectors);

        let mut fat_sectors: Vec<u32> = header
            .difat
            .iter()
            .copied()
            .filter(|&s| s < MAX_REGULAR_SECTOR)
            .collect();

        let entries_per_difat = self.sector_size / 4 - 1;
        let mut difat_sector = header.first_difat_sector;
        let mut difat_visited = FxHashSet::default();

        while difat_sector < MAX_REGULAR_SECTOR
            && difat_visited.len() < header.num_difat_sectors as usize
            && fat_sectors.len() < wanted
        {
            if !difat_visited.insert(difat_sector) {
                return Err(OleError::ChainLoop {
                    start: header.first_difat_sector,
                });
            }
            let sector = self.read_sector(difat_sector)?;
            let mut values = u32_values(sector);
            fat_sectors.extend(
                values
                    .by_ref()
                    .take(entries_per_difat)
                    .filter(|&s| s < MAX_REGULAR_SECTOR),
            );
            difat_sector = values.next().unwrap_or(ENDOFCHAIN);
        }

        if fat_sectors.is_empty() && header.num_fat_sectors > 0 {
            return Err(OleError::InvalidHeader {
                field: "num_fat_sectors",
                value: header.num_fat_sectors,
            });
        }

        fat_sectors.truncate(wanted);

        let mut seen = FxHashSet::default();

        for sector in fat_sectors {
            if !seen.insert(sector) {
                return Err(OleError::DuplicateFatSector { sector });
            }
            let sector = self.read_sector(sector)?;
            self.fat.extend(u32_values(sector));
        }

        Ok(())
    }

    /// Follows a whole chain in the FAT.
    fn follow_chain(&self, start: u32) -> Result<Vec<u32>, OleError> {
        follow(&self.fat, start)
    }

    /// Reads every entry in the directory chain.
    fn read_directory(
        &self,
        first_sector: u32,
    ) -> Result<Vec<DirectoryEntry>, OleError> {
        let mut entries = Vec::new();
        for sector in self.follow_chain(first_sector)? {
            let sector = self.read_sector(sector)?;
            for raw in sector.chunks_exact(DIRECTORY_ENTRY_SIZE) {
                let (_, entry) =
                    parse_directory_entry(raw, self.major_version)?;
                entries.push(entry);
            }
        }
        Ok(entries)
    }

    /// Walks the red-black tree of the directory starting at the root
    /// entry, building the path of every stream.
    fn walk_directory(
        &mut self,
        entries: &[DirectoryEntry],
    ) -> Result<(), OleError> {
        let root = entries.first().ok_or(OleError::MissingRoot)?;
        if root.entry_type != ROOT_STORAGE_TYPE {
            return Err(OleError::MissingRoot);
        }

        // The root entry's sector chain holds the mini stream.
        if root.size > 0 {
            self.mini_stream_sectors = self.follow_chain(root.start_sector)?;
            self.mini_stream_size = root.size.min(
                (self.mini_stream_sectors.len() * self.sector_size) as u64,
            );
        }

        let mut visited = vec![false; entries.len()];
        visited[0] = true;

        let mut found = Vec::new();
        let mut pending = vec![(0_u32, root.child, String::new())];

        while let Some((parent, id, parent_path)) = pending.pop() {
            if id == NOSTREAM {
                continue;
            }
            let entry = entries.get(id as usize).ok_or(
                OleError::DirectoryOutOfRange { entry: parent, target: id },
            )?;
            if std::mem::replace(&mut visited[id as usize], true) {
                return Err(OleError::DirectoryLoop { entry: id });
            }

            pending.push((id, entry.left, parent_path.clone()));
            pending.push((id, entry.right, parent_path.clone()));

            let name = normalize_name(&entry.raw_name);
            let path = if parent_path.is_empty() {
                name.clone()
            } else {
                format!("{}/{}", parent_path, name)
            };

            match entry.entry_type {
                STORAGE_TYPE => pending.push((id, entry.child, path)),
                STREAM_TYPE => found.push((id, entry, name, path)),
                // Unused entries and unknown types are ignored, their
                // subtrees too.
                _ => {}
            }
        }

        // Streams are kept in directory order, which doesn't depend on
        // the order in which the tree was walked.
        found.sort_by_key(|(id, ..)| *id);

        self.streams = found
            .into_iter()
            .map(|(_, entry, name, path)| StreamEntry {
                raw_name: entry.raw_name.clone(),
                name,
                path,
                size: entry.size,
                start_sector: entry.start_sector,
            })
            .collect();

        Ok(())
    }

    /// Returns the payload offset of the first byte of a stream, checking
    /// that the stream's chain covers its declared size.
    ///
    /// Only the sectors needed by the declared size are walked.
    pub fn locate(&self, stream: &StreamEntry) -> Result<u64, OleError> {
        let out_of_range =
            || OleError::StreamOutOfRange { name: stream.path.clone() };

        if stream.size == 0 {
            return Ok(0);
        }

        let (table, sector_size) = if stream.in_mini_stream() {
            (&self.mini_fat, self.mini_sector_size)
        } else {
            (&self.fat, self.sector_size)
        };

        let needed = sectors_for(stream.size, sector_size);
        let mut covered = 0;

        for sector in Chain::new(table, stream.start_sector).take(needed) {
            sector?;
            covered += 1;
        }

        if covered < needed {
            return Err(out_of_range());
        }

        let offset = if stream.in_mini_stream() {
            self.mini_sector_offset(stream.start_sector)
                .map_err(|_| out_of_range())?
        } else {
            self.sector_offset(stream.start_sector).ok_or_else(out_of_range)?
        };

        if offset >= self.data.len() {
            return Err(out_of_range());
        }

        Ok(offset as u64)
    }
}

/// Number of sectors of `sector_size` bytes needed for `size` bytes.
fn sectors_for(size: u64, sector_size: usize) -> usize {
    usize::try_from(size.div_ceil(sector_size as u64)).unwrap_or(usize::MAX)
}

/// Iterates the sectors of a chain in an allocation table.
///
/// A chain without loops can't be longer than the table itself, longer
/// chains end with [`OleError::ChainLoop`]. Callers that need the whole
/// chain use [`follow`], which detects loops as soon as they close.
struct Chain<'t> {
    table: &'t [u32],
    start: u32,
    current: u32,
    steps: usize,
    done: bool,
}

impl<'t> Chain<'t> {
    fn new(table: &'t [u32], start: u32) -> Self {
        Self { table, start, current: start, steps: 0, done: false }
    }

    fn fail(&mut self, err: OleError) -> Option<Result<u32, OleError>> {
        self.done = true;
        Some(Err(err))
    }
}

impl Iterator for Chain<'_> {
    type Item = Result<u32, OleError>;

    fn next(&mut self) -> Option<Self::Item> {
        let current = self.current;

        if self.done || current == ENDOFCHAIN || current == FREESECT {
            return None;
        }
        if current > MAX_REGULAR_SECTOR {
            return self.fail(OleError::SectorOutOfRange { sector: current });
        }
        if self.steps >= self.table.len() {
            return self.fail(OleError::ChainLoop { start: self.start });
        }

        match self.table.get(current as usize) {
            Some(next) => {
                self.current = *next;
                self.steps += 1;
                Some(Ok(current))
            }
            None => self.fail(OleError::FatOutOfRange { sector: current }),
        }
    }
}

/// Follows a whole chain, failing as soon as some sector is visited
/// twice. The chain has no repeated sectors, so reading all of them never
/// reads more than the payload.
fn follow(table: &[u32], start: u32) -> Result<Vec<u32>, OleError> {
    let mut visited = vec![false; table.len()];
    let mut chain = Vec::new();

    for sector in Chain::new(table, start) {
        let sector = sector?;
        // The chain only yields sectors that have an entry in the table.
        if let Some(seen) = visited.get_mut(sector as usize) {
            if std::mem::replace(seen, true) {
                return Err(OleError::ChainLoop { start });
            }
        }
        chain.push(sector);
    }

    Ok(chain)
}

/// Strips control characters from a stored name.
pub(crate) fn normalize_name(raw: &[u8]) -> String {
    decode_utf16_lossy(raw).chars().filter(|c| !c.is_control()).collect()
}

fn u32_values(data: &[u8]) -> impl Iterator<Item = u32> + '_ {
    data.chunks_exact(4)
        .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

fn validate_header(header: &Header) -> Result<(), OleError> {
    match (header.major_version, header.sector_shift) {
        (3, 9) | (4, 12) => {}
        (3 | 4, shift) => {
            return Err(OleError::InvalidHeader {
                field: "sector_shift",
                value: shift as u32,
            })
        }
        (major, _) => {
            return Err(OleError::InvalidHeader {
                field: "major_version",
                value: major as u32,
            })
        }
    }
    if header.mini_sector_shift != MINI_SECTOR_SHIFT {
        return Err(OleError::InvalidHeader {
            field: "mini_sector_shift",
            value: header.mini_sector_shift as u32,
        });
    }
    if header.mini_stream_cutoff != MINI_STREAM_CUTOFF {
        return Err(OleError::InvalidHeader {
            field: "mini_stream_cutoff",
            value: header.mini_stream_cutoff,
        });
    }
    if header.first_dir_sector >= MAX_REGULAR_SECTOR {
        return Err(OleError::InvalidHeader {
            field: "first_dir_sector",
            value: header.first_dir_sector,
        });
    }
    Ok(())
}

fn parse_header(input: &[u8]) -> IResult<&[u8], Header> {
    let (
        input,
        (
            _signature,
            _clsid,
            _minor_version,
            major_version,
            _byte_order,
            sector_shift,
            mini_sector_shift,
            _reserved,
            _num_dir_sectors,
            num_fat_sectors,
            first_dir_sector,
            _transaction_signature,
            mini_stream_cutoff,
            first_mini_fat_sector,
            num_mini_fat_sectors,
            first_difat_sector,
            num_difat_sectors,
        ),
    ) = tuple((
        take(8_usize),
        take(16_usize),
        le_u16,
        le_u16,
        verify(le_u16, |byte_order| *byte_order == 0xFFFE),
        le_u16,
        le_u16,
        take(6_usize),
        le_u32,
        le_u32,
        le_u32,
        le_u32,
        le_u32,
        le_u32,
        le_u32,
        le_u32,
        le_u32,
    ))(input)?;

    let (input, difat) = count(le_u32, HEADER_DIFAT_ENTRIES)(input)?;

    Ok((
        input,
        Header {
            major_version,
            sector_shift,
            mini_sector_shift,
            num_fat_sectors,
            first_dir_sector,
            mini_stream_cutoff,
            first_mini_fat_sector,
            num_mini_fat_sectors,
            first_difat_sector,
            num_difat_sectors,
            difat,
        },
    ))
}

/// Parses a directory entry of a file with the given major version.
pub(crate) fn parse_directory_entry(
    input: &[u8],
    major_version: u16,
) -> IResult<&[u8], DirectoryEntry> {
    let (
        input,
        (
            name,
            name_len,
            entry_type,
            _color,
            left,
            right,
            child,
            _clsid,
            _state_bits,
            _creation_time,
            _modified_time,
            start_sector,
            size,
        ),
    ) = tuple((
        take(64_usize),
        le_u16,
        le_u8,
        le_u8,
        le_u32,
        le_u32,
        le_u32,
        take(16_usize),
        le_u32,
        take(8_usize),
        take(8_usize),
        le_u32,
        le_u64,
    ))(input)?;

    // The length includes the terminating null character. Lengths that
    // don't fit in the name field are clamped, odd lengths are rounded
    // down to a whole UTF-16 code unit.
    let name_len = (name_len as usize).min(64) & !1;
    let raw_name = name[..name_len.saturating_sub(2)].to_vec();

    Ok((
        input,
        DirectoryEntry {
            raw_name,
            entry_type,
            left,
            right,
            child,
            start_sector,
            // Version 3 files may have garbage in the high 32 bits.
            size: if major_version == 3 { size & 0xFFFF_FFFF } else { size },
        },
    ))
}
