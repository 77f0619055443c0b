//! CRC32-protected serialization of compiled shader binaries
//!
//! A blob is a fixed header {total size, binary type, crc32} followed by the
//! hardware config record, the resource-usage info record, the exec size, and
//! three length-prefixed chunks (machine code, symbol table, optional IR
//! text). Every record and chunk is padded to a dword boundary so the whole
//! blob can be walked as u32 words. The CRC covers everything after the
//! header; a mismatch is the only versioning mechanism, so any layout change
//! here must also bump the backend version fed into the cache key.

use crate::CacheError;

/// Size of the blob header: {size, binary_type, crc32}.
pub const BLOB_HEADER_SIZE: usize = 12;

/// How the machine code chunk is to be interpreted by the loader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryType {
    /// Relocatable ELF produced by the backend linker.
    Elf,
    /// Raw, pre-linked machine code.
    Raw,
}

impl BinaryType {
    fn from_u32(v: u32) -> Result<Self, CacheError> {
        match v {
            0 => Ok(BinaryType::Elf),
            1 => Ok(BinaryType::Raw),
            _ => Err(CacheError::CorruptCache("unknown binary type tag")),
        }
    }

    fn as_u32(self) -> u32 {
        match self {
            BinaryType::Elf => 0,
            BinaryType::Raw => 1,
        }
    }
}

/// Hardware resource configuration of one compiled shader.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShaderConfig {
    pub num_sgprs: u32,
    pub num_vgprs: u32,
    pub spilled_sgprs: u32,
    pub spilled_vgprs: u32,
    pub lds_size: u32,
    pub scratch_bytes_per_wave: u32,
    pub float_mode: u32,
    pub rsrc1: u32,
    pub rsrc2: u32,
}

impl ShaderConfig {
    const WORDS: usize = 9;

    fn to_words(self) -> [u32; Self::WORDS] {
        [
            self.num_sgprs,
            self.num_vgprs,
            self.spilled_sgprs,
            self.spilled_vgprs,
            self.lds_size,
            self.scratch_bytes_per_wave,
            self.float_mode,
            self.rsrc1,
            self.rsrc2,
        ]
    }

    fn from_words(w: [u32; Self::WORDS]) -> Self {
        Self {
            num_sgprs: w[0],
            num_vgprs: w[1],
            spilled_sgprs: w[2],
            spilled_vgprs: w[3],
            lds_size: w[4],
            scratch_bytes_per_wave: w[5],
            float_mode: w[6],
            rsrc1: w[7],
            rsrc2: w[8],
        }
    }
}

/// Resource-usage metadata scanned from the shader, consumed by ring and
/// scratch sizing at dispatch time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShaderInfo {
    pub num_input_sgprs: u32,
    pub num_input_vgprs: u32,
    pub private_mem_vgprs: u32,
    pub esgs_vertex_stride: u32,
    pub gs_input_verts_per_prim: u32,
    pub max_gsvs_emit_size: u32,
    pub flags: u32,
}

impl ShaderInfo {
    const WORDS: usize = 7;

    fn to_words(self) -> [u32; Self::WORDS] {
        [
            self.num_input_sgprs,
            self.num_input_vgprs,
            self.private_mem_vgprs,
            self.esgs_vertex_stride,
            self.gs_input_verts_per_prim,
            self.max_gsvs_emit_size,
            self.flags,
        ]
    }

    fn from_words(w: [u32; Self::WORDS]) -> Self {
        Self {
            num_input_sgprs: w[0],
            num_input_vgprs: w[1],
            private_mem_vgprs: w[2],
            esgs_vertex_stride: w[3],
            gs_input_verts_per_prim: w[4],
            max_gsvs_emit_size: w[5],
            flags: w[6],
        }
    }
}

/// A compiled shader binary as produced by the backend compiler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShaderBinary {
    pub binary_type: BinaryType,
    pub config: ShaderConfig,
    pub info: ShaderInfo,
    pub exec_size: u32,
    pub code: Vec<u8>,
    pub symbols: Vec<u64>,
    pub ir_text: Option<String>,
}

impl Default for ShaderBinary {
    fn default() -> Self {
        Self {
            binary_type: BinaryType::Raw,
            config: ShaderConfig::default(),
            info: ShaderInfo::default(),
            exec_size: 0,
            code: Vec::new(),
            symbols: Vec::new(),
            ir_text: None,
        }
    }
}

fn align4(v: usize) -> usize {
    (v + 3) & !3
}

struct BlobWriter {
    buf: Vec<u8>,
}

impl BlobWriter {
    fn with_capacity(cap: usize) -> Self {
        Self {
            buf: Vec::with_capacity(cap),
        }
    }

    fn put_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    /// Copy raw bytes, padding to the next dword boundary.
    fn put_data(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
        let pad = align4(data.len()) - data.len();
        self.buf.extend_from_slice(&[0u8; 3][..pad]);
    }

    /// Write the byte length followed by the (padded) data. A zero length
    /// produces only the 4-byte length field.
    fn put_chunk(&mut self, data: &[u8]) {
        self.put_u32(data.len() as u32);
        if !data.is_empty() {
            self.put_data(data);
        }
    }
}

struct BlobReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> BlobReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn get_u32(&mut self) -> Result<u32, CacheError> {
        let end = self.pos.checked_add(4).ok_or(CacheError::OutOfMemory)?;
        let bytes = self
            .buf
            .get(self.pos..end)
            .ok_or(CacheError::CorruptCache("truncated blob"))?;
        self.pos = end;
        Ok(u32::from_le_bytes(bytes.try_into().unwrap()))
    }

    /// Read `len` raw bytes, advancing past the dword padding.
    fn get_data(&mut self, len: usize) -> Result<&'a [u8], CacheError> {
        let end = self.pos.checked_add(len).ok_or(CacheError::OutOfMemory)?;
        let bytes = self
            .buf
            .get(self.pos..end)
            .ok_or(CacheError::CorruptCache("truncated blob"))?;
        self.pos = self.pos.checked_add(align4(len)).ok_or(CacheError::OutOfMemory)?;
        if self.pos > self.buf.len() {
            return Err(CacheError::CorruptCache("truncated blob"));
        }
        Ok(bytes)
    }

    fn get_chunk(&mut self) -> Result<&'a [u8], CacheError> {
        let len = self.get_u32()? as usize;
        if len == 0 {
            return Ok(&[]);
        }
        self.get_data(len)
    }
}

/// Total encoded size of one binary, including the header.
fn encoded_size(binary: &ShaderBinary) -> Result<usize, CacheError> {
    let ir_size = binary.ir_text.as_ref().map(|s| s.len() + 1).unwrap_or(0);

    // Refuse to build overly large buffers and guard the size math against
    // overflow before any of it happens.
    if binary.code.len() > u32::MAX as usize / 4
        || ir_size > u32::MAX as usize / 4
        || binary.symbols.len() > u32::MAX as usize / 32
    {
        return Err(CacheError::OutOfMemory);
    }

    let size = BLOB_HEADER_SIZE
        + ShaderConfig::WORDS * 4
        + ShaderInfo::WORDS * 4
        + 4
        + 4 + align4(binary.code.len())
        + 4 + binary.symbols.len() * 8
        + 4 + align4(ir_size);

    if size > u32::MAX as usize {
        return Err(CacheError::OutOfMemory);
    }
    Ok(size)
}

/// Serialize one compiled shader into a self-describing blob.
pub fn encode(binary: &ShaderBinary) -> Result<Vec<u8>, CacheError> {
    let size = encoded_size(binary)?;
    let mut w = BlobWriter::with_capacity(size);

    // Header; the CRC is patched in once the body is written.
    w.put_u32(size as u32);
    w.put_u32(binary.binary_type.as_u32());
    w.put_u32(0);

    for word in binary.config.to_words() {
        w.put_u32(word);
    }
    for word in binary.info.to_words() {
        w.put_u32(word);
    }
    w.put_u32(binary.exec_size);
    w.put_chunk(&binary.code);

    let mut symbol_bytes = Vec::with_capacity(binary.symbols.len() * 8);
    for sym in &binary.symbols {
        symbol_bytes.extend_from_slice(&sym.to_le_bytes());
    }
    w.put_chunk(&symbol_bytes);

    match &binary.ir_text {
        Some(text) => {
            let mut bytes = Vec::with_capacity(text.len() + 1);
            bytes.extend_from_slice(text.as_bytes());
            bytes.push(0);
            w.put_chunk(&bytes);
        }
        None => w.put_chunk(&[]),
    }

    let mut buf = w.buf;
    debug_assert_eq!(buf.len(), size);

    let crc = crc32fast::hash(&buf[BLOB_HEADER_SIZE..]);
    buf[8..12].copy_from_slice(&crc.to_le_bytes());
    Ok(buf)
}

/// Deserialize one blob. `bytes` must start at a blob header but may extend
/// past the blob (group decoding slices blobs out of a combined buffer).
pub fn decode(bytes: &[u8]) -> Result<ShaderBinary, CacheError> {
    if bytes.len() < BLOB_HEADER_SIZE {
        return Err(CacheError::CorruptCache("blob shorter than header"));
    }
    let mut r = BlobReader::new(bytes);
    let size = r.get_u32()? as usize;
    let type_tag = r.get_u32()?;
    let crc = r.get_u32()?;

    if size < BLOB_HEADER_SIZE || size > bytes.len() {
        return Err(CacheError::CorruptCache("blob size out of bounds"));
    }
    if crc32fast::hash(&bytes[BLOB_HEADER_SIZE..size]) != crc {
        return Err(CacheError::CorruptCache("CRC32 mismatch"));
    }

    let mut r = BlobReader::new(&bytes[..size]);
    r.pos = BLOB_HEADER_SIZE;

    let binary_type = BinaryType::from_u32(type_tag)?;

    let mut config_words = [0u32; ShaderConfig::WORDS];
    for word in &mut config_words {
        *word = r.get_u32()?;
    }
    let mut info_words = [0u32; ShaderInfo::WORDS];
    for word in &mut info_words {
        *word = r.get_u32()?;
    }
    let exec_size = r.get_u32()?;
    let code = r.get_chunk()?.to_vec();

    let symbol_bytes = r.get_chunk()?;
    if symbol_bytes.len() % 8 != 0 {
        return Err(CacheError::CorruptCache("symbol table not 8-byte aligned"));
    }
    let symbols = symbol_bytes
        .chunks_exact(8)
        .map(|c| u64::from_le_bytes(c.try_into().unwrap()))
        .collect();

    let ir_bytes = r.get_chunk()?;
    let ir_text = if ir_bytes.is_empty() {
        None
    } else {
        let stripped = ir_bytes.strip_suffix(&[0]).unwrap_or(ir_bytes);
        Some(
            std::str::from_utf8(stripped)
                .map_err(|_| CacheError::CorruptCache("IR text is not UTF-8"))?
                .to_owned(),
        )
    };

    Ok(ShaderBinary {
        binary_type,
        config: ShaderConfig::from_words(config_words),
        info: ShaderInfo::from_words(info_words),
        exec_size,
        code,
        symbols,
        ir_text,
    })
}

/// Serialize a group of 1 or 2 binaries back to back. Two-element groups are
/// used for geometry variants paired with their GS copy shader.
pub fn encode_group(group: &[ShaderBinary]) -> Result<Vec<u8>, CacheError> {
    debug_assert!(matches!(group.len(), 1 | 2));
    let mut combined = Vec::new();
    for binary in group {
        combined.extend_from_slice(&encode(binary)?);
    }
    Ok(combined)
}

/// Split and deserialize a blob group. The group length is fixed up front by
/// `expect_copy_shader` and the leading size fields must account for the
/// whole buffer exactly; any mismatch is corruption.
pub fn decode_group(bytes: &[u8], expect_copy_shader: bool) -> Result<Vec<ShaderBinary>, CacheError> {
    if bytes.len() < BLOB_HEADER_SIZE {
        return Err(CacheError::CorruptCache("blob group shorter than header"));
    }
    let first_size = u32::from_le_bytes(bytes[0..4].try_into().unwrap()) as usize;
    if first_size < BLOB_HEADER_SIZE || first_size > bytes.len() {
        return Err(CacheError::CorruptCache("blob size out of bounds"));
    }

    let count = if expect_copy_shader { 2 } else { 1 };
    let mut group = Vec::with_capacity(count);
    group.push(decode(&bytes[..first_size])?);

    if expect_copy_shader {
        let rest = &bytes[first_size..];
        if rest.len() < BLOB_HEADER_SIZE {
            return Err(CacheError::CorruptCache("missing paired copy-shader blob"));
        }
        let second_size = u32::from_le_bytes(rest[0..4].try_into().unwrap()) as usize;
        if second_size != rest.len() {
            return Err(CacheError::CorruptCache("blob group size bookkeeping mismatch"));
        }
        group.push(decode(rest)?);
    } else if first_size != bytes.len() {
        return Err(CacheError::CorruptCache("blob group size bookkeeping mismatch"));
    }

    Ok(group)
}
