//! Minimal ISO-9660 writer.
//!
//! Produces a single-session image with one root directory and plain files:
//! enough for a NoCloud seed. Timestamps are fixed and directory records are
//! sorted, so the output only depends on the label and the file contents.

use thiserror::Error;

pub const SECTOR_SIZE: usize = 2048;

const PRIMARY_DESCRIPTOR_SECTOR: u32 = 16;
const TERMINATOR_SECTOR: u32 = 17;
const L_PATH_TABLE_SECTOR: u32 = 18;
const M_PATH_TABLE_SECTOR: u32 = 19;
const ROOT_DIRECTORY_SECTOR: u32 = 20;
const FIRST_FILE_SECTOR: u32 = 21;

const PATH_TABLE_SIZE: u32 = 10;
const ROOT_RECORD_OFFSET: usize = 156;

const FLAG_DIRECTORY: u8 = 0x02;

// 1970-01-01 00:00:00 UTC
const RECORDING_DATE: [u8; 7] = [70, 1, 1, 0, 0, 0, 0];
const VOLUME_DATE: &[u8; 16] = b"1970010100000000";
const UNSET_DATE: &[u8; 16] = b"0000000000000000";

const MAX_LABEL_LEN: usize = 32;
const MAX_IDENTIFIER_LEN: usize = 222;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IsoError {
    #[error("volume label '{0}' must be at most 32 ASCII characters")]
    InvalidLabel(String),
    #[error("invalid file name '{0}'")]
    InvalidFileName(String),
    #[error("duplicate file name '{0}'")]
    DuplicateFile(String),
    #[error("file '{0}' is too large")]
    FileTooLarge(String),
    #[error("too many files for a single directory sector")]
    DirectoryFull,
}

#[derive(Debug, Clone)]
struct IsoFile {
    name: String,
    data: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct IsoImage {
    label: String,
    files: Vec<IsoFile>,
}

impl IsoImage {
    pub fn new(label: impl AsRef<str>) -> Self {
        Self {
            label: label.as_ref().to_string(),
            files: Vec::new(),
        }
    }

    pub fn add_file(&mut self, name: impl AsRef<str>, data: impl Into<Vec<u8>>) -> &mut Self {
        self.files.push(IsoFile {
            name: name.as_ref().to_string(),
            data: data.into(),
        });
        self
    }

    pub fn build(&self) -> Result<Vec<u8>, IsoError> {
        if self.label.len() > MAX_LABEL_LEN || !self.label.is_ascii() {
            return Err(IsoError::InvalidLabel(self.label.clone()));
        }

        let mut files: Vec<&IsoFile> = self.files.iter().collect();
        files.sort_by(|a, b| a.name.cmp(&b.name));

        for pair in files.windows(2) {
            if pair[0].name == pair[1].name {
                return Err(IsoError::DuplicateFile(pair[0].name.clone()));
            }
        }

        let mut next_sector = FIRST_FILE_SECTOR;
        let mut extents = Vec::with_capacity(files.len());
        for file in &files {
            validate_file_name(&file.name)?;
            let size = u32::try_from(file.data.len())
                .map_err(|_| IsoError::FileTooLarge(file.name.clone()))?;

            extents.push((next_sector, size));
            next_sector = next_sector
                .checked_add(sectors_for(file.data.len()))
                .ok_or_else(|| IsoError::FileTooLarge(file.name.clone()))?;
        }
        let total_sectors = next_sector;

        let root_size = SECTOR_SIZE as u32;
        let mut root = Vec::with_capacity(SECTOR_SIZE);
        root.extend(directory_record(&[0x00], ROOT_DIRECTORY_SECTOR, root_size, FLAG_DIRECTORY));
        root.extend(directory_record(&[0x01], ROOT_DIRECTORY_SECTOR, root_size, FLAG_DIRECTORY));
        for (file, (location, size)) in files.iter().zip(&extents) {
            let identifier = format!("{};1", file.name);
            root.extend(directory_record(identifier.as_bytes(), *location, *size, 0));
        }
        if root.len() > SECTOR_SIZE {
            return Err(IsoError::DirectoryFull);
        }

        let mut image = vec![0u8; total_sectors as usize * SECTOR_SIZE];

        write_sector(
            &mut image,
            PRIMARY_DESCRIPTOR_SECTOR,
            &primary_volume_descriptor(&self.label, total_sectors),
        );
        write_sector(&mut image, TERMINATOR_SECTOR, &terminator_descriptor());
        write_sector(&mut image, L_PATH_TABLE_SECTOR, &path_table(false));
        write_sector(&mut image, M_PATH_TABLE_SECTOR, &path_table(true));
        write_sector(&mut image, ROOT_DIRECTORY_SECTOR, &root);

        for (file, (location, _)) in files.iter().zip(&extents) {
            let offset = *location as usize * SECTOR_SIZE;
            image[offset..offset + file.data.len()].copy_from_slice(&file.data);
        }

        Ok(image)
    }
}

fn validate_file_name(name: &str) -> Result<(), IsoError> {
    let valid = !name.is_empty()
        && name.len() + 2 <= MAX_IDENTIFIER_LEN
        && name.is_ascii()
        && !name.contains(['/', ';', '\0']);

    if !valid {
        return Err(IsoError::InvalidFileName(name.to_string()));
    }
    Ok(())
}

fn sectors_for(len: usize) -> u32 {
    len.div_ceil(SECTOR_SIZE) as u32
}

fn write_sector(image: &mut [u8], sector: u32, data: &[u8]) {
    let offset = sector as usize * SECTOR_SIZE;
    image[offset..offset + data.len()].copy_from_slice(data);
}

fn both_endian_u32(value: u32) -> [u8; 8] {
    let mut out = [0u8; 8];
    out[..4].copy_from_slice(&value.to_le_bytes());
    out[4..].copy_from_slice(&value.to_be_bytes());
    out
}

fn both_endian_u16(value: u16) -> [u8; 4] {
    let mut out = [0u8; 4];
    out[..2].copy_from_slice(&value.to_le_bytes());
    out[2..].copy_from_slice(&value.to_be_bytes());
    out
}

fn write_padded(buf: &mut [u8], offset: usize, len: usize, value: &str) {
    let field = &mut buf[offset..offset + len];
    field.fill(b' ');
    let bytes = value.as_bytes();
    field[..bytes.len()].copy_from_slice(bytes);
}

fn write_volume_date(buf: &mut [u8], offset: usize, digits: &[u8; 16]) {
    buf[offset..offset + 16].copy_from_slice(digits);
    buf[offset + 16] = 0;
}

fn directory_record(identifier: &[u8], location: u32, size: u32, flags: u8) -> Vec<u8> {
    // records start on even offsets, odd-length identifiers already leave the record even
    let padding = if identifier.len() % 2 == 0 { 1 } else { 0 };
    let len = 33 + identifier.len() + padding;

    let mut record = vec![0u8; len];
    record[0] = len as u8;
    record[2..10].copy_from_slice(&both_endian_u32(location));
    record[10..18].copy_from_slice(&both_endian_u32(size));
    record[18..25].copy_from_slice(&RECORDING_DATE);
    record[25] = flags;
    record[28..32].copy_from_slice(&both_endian_u16(1));
    record[32] = identifier.len() as u8;
    record[33..33 + identifier.len()].copy_from_slice(identifier);
    record
}

fn primary_volume_descriptor(label: &str, total_sectors: u32) -> Vec<u8> {
    let mut pvd = vec![0u8; SECTOR_SIZE];
    pvd[0] = 1;
    pvd[1..6].copy_from_slice(b"CD001");
    pvd[6] = 1;

    write_padded(&mut pvd, 8, 32, "");
    write_padded(&mut pvd, 40, 32, label);
    pvd[80..88].copy_from_slice(&both_endian_u32(total_sectors));
    pvd[120..124].copy_from_slice(&both_endian_u16(1));
    pvd[124..128].copy_from_slice(&both_endian_u16(1));
    pvd[128..132].copy_from_slice(&both_endian_u16(SECTOR_SIZE as u16));
    pvd[132..140].copy_from_slice(&both_endian_u32(PATH_TABLE_SIZE));
    pvd[140..144].copy_from_slice(&L_PATH_TABLE_SECTOR.to_le_bytes());
    pvd[148..152].copy_from_slice(&M_PATH_TABLE_SECTOR.to_be_bytes());

    let root = directory_record(&[0x00], ROOT_DIRECTORY_SECTOR, SECTOR_SIZE as u32, FLAG_DIRECTORY);
    pvd[ROOT_RECORD_OFFSET..ROOT_RECORD_OFFSET + root.len()].copy_from_slice(&root);

    write_padded(&mut pvd, 190, 128, "");
    write_padded(&mut pvd, 318, 128, "");
    write_padded(&mut pvd, 446, 128, "");
    write_padded(&mut pvd, 574, 128, "PROVISIONER");
    write_padded(&mut pvd, 702, 37, "");
    write_padded(&mut pvd, 739, 37, "");
    write_padded(&mut pvd, 776, 37, "");

    write_volume_date(&mut pvd, 813, VOLUME_DATE);
    write_volume_date(&mut pvd, 830, VOLUME_DATE);
    write_volume_date(&mut pvd, 847, UNSET_DATE);
    write_volume_date(&mut pvd, 864, UNSET_DATE);
    pvd[881] = 1;

    pvd
}

fn terminator_descriptor() -> Vec<u8> {
    let mut descriptor = vec![0u8; SECTOR_SIZE];
    descriptor[0] = 255;
    descriptor[1..6].copy_from_slice(b"CD001");
    descriptor[6] = 1;
    descriptor
}

fn path_table(big_endian: bool) -> Vec<u8> {
    let mut table = vec![0u8; PATH_TABLE_SIZE as usize];
    table[0] = 1;
    if big_endian {
        table[2..6].copy_from_slice(&ROOT_DIRECTORY_SECTOR.to_be_bytes());
        table[6..8].copy_from_slice(&1u16.to_be_bytes());
    } else {
        table[2..6].copy_from_slice(&ROOT_DIRECTORY_SECTOR.to_le_bytes());
        table[6..8].copy_from_slice(&1u16.to_le_bytes());
    }
    table
}
