//! Binary model container
//!
//! Layout, little-endian throughout:
//!   magic "NBQ1" | version u32
//!   hyperparameter block: 11 u32 values
//!   tokenizer section: per token a length-prefixed UTF-8 string + f32 score
//!   tensor directory: {name_len, name, n_dims, dims[], dtype_tag, offset, size}
//!   data region, each tensor 32-byte aligned, quantized payloads packed as
//!   [codes][scales][zero_points?]
//!
//! The reader parses the header sections, then hands out tensor payloads as
//! slices of the shared mapping.

use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use memmap2::Mmap;
use tracing::{debug, info};

use crate::quant::block::{n_scale_blocks, DataRef, DenseTensor, QuantMatrix};
use crate::quant::format::TensorDType;
use crate::quant::WeightTensor;
use crate::utils::{EngineError, Result};

pub const MAGIC: [u8; 4] = *b"NBQ1";
pub const FORMAT_VERSION: u32 = 1;
pub const DATA_ALIGNMENT: usize = 32;

const MAX_NAME_LEN: usize = 4096;
const MAX_TOKEN_LEN: usize = 65536;

/// Fixed hyperparameter block, stored as ordered u32 values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HyperParams {
    pub n_vocab: u32,
    pub n_embd: u32,
    pub n_head: u32,
    pub n_kv_head: u32,
    pub head_dim: u32,
    pub n_ff: u32,
    pub n_layer: u32,
    pub arch_tag: u32,
    /// f32 bit pattern of the RoPE frequency base
    pub rope_theta_bits: u32,
    pub ctx_max: u32,
    pub eos_token_id: u32,
}

impl HyperParams {
    pub fn rope_theta(&self) -> f32 {
        f32::from_bits(self.rope_theta_bits)
    }

    pub fn set_rope_theta(&mut self, theta: f32) {
        self.rope_theta_bits = theta.to_bits();
    }

    fn write(&self, out: &mut Vec<u8>) {
        for v in [
            self.n_vocab,
            self.n_embd,
            self.n_head,
            self.n_kv_head,
            self.head_dim,
            self.n_ff,
            self.n_layer,
            self.arch_tag,
            self.rope_theta_bits,
            self.ctx_max,
            self.eos_token_id,
        ] {
            out.extend_from_slice(&v.to_le_bytes());
        }
    }

    fn read(cur: &mut Cursor<'_>) -> Result<Self> {
        Ok(Self {
            n_vocab: cur.read_u32()?,
            n_embd: cur.read_u32()?,
            n_head: cur.read_u32()?,
            n_kv_head: cur.read_u32()?,
            head_dim: cur.read_u32()?,
            n_ff: cur.read_u32()?,
            n_layer: cur.read_u32()?,
            arch_tag: cur.read_u32()?,
            rope_theta_bits: cur.read_u32()?,
            ctx_max: cur.read_u32()?,
            eos_token_id: cur.read_u32()?,
        })
    }
}

/// One tokenizer vocabulary entry
#[derive(Debug, Clone, PartialEq)]
pub struct VocabEntry {
    pub text: String,
    pub score: f32,
}

/// One tensor directory entry
#[derive(Debug, Clone)]
pub struct TensorEntry {
    pub name: String,
    pub dims: Vec<usize>,
    pub dtype: TensorDType,
    pub data_offset: u64,
    pub data_size: u64,
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.pos + n > self.buf.len() {
            return Err(EngineError::MalformedModel(format!(
                "unexpected end of file at offset {}",
                self.pos
            )));
        }
        let s = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(s)
    }

    fn read_u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn read_u64(&mut self) -> Result<u64> {
        let b = self.take(8)?;
        Ok(u64::from_le_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    fn read_f32(&mut self) -> Result<f32> {
        Ok(f32::from_bits(self.read_u32()?))
    }

    fn read_string(&mut self, max_len: usize) -> Result<String> {
        let len = self.read_u32()? as usize;
        if len > max_len {
            return Err(EngineError::MalformedModel(format!(
                "string length {len} exceeds limit {max_len}"
            )));
        }
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| EngineError::MalformedModel("invalid UTF-8 in string".into()))
    }
}

/// Expected payload size in bytes for a tensor of `dims` and `dtype`.
pub fn payload_size(dims: &[usize], dtype: TensorDType) -> usize {
    let numel: usize = dims.iter().product();
    match dtype {
        TensorDType::F32 => numel * 4,
        TensorDType::F16 | TensorDType::Bf16 => numel * 2,
        TensorDType::Quantized {
            weight,
            scale,
            has_zero_points,
            group_size,
            pack_row,
        } => {
            let rows = dims[0];
            let cols = numel / rows.max(1);
            let code_bytes = match weight.code_bits() {
                4 => numel.div_ceil(2),
                _ => numel,
            };
            let n_blocks = n_scale_blocks(rows, group_size, pack_row);
            code_bytes
                + n_blocks * cols * scale.size_bytes()
                + if has_zero_points { n_blocks * cols } else { 0 }
        }
    }
}

/// A parsed model file backed by a shared memory map.
#[derive(Debug)]
pub struct ModelFile {
    map: Arc<Mmap>,
    hparams: HyperParams,
    vocab: Vec<VocabEntry>,
    tensors: Vec<TensorEntry>,
}

impl ModelFile {
    pub fn open(path: &Path) -> Result<ModelFile> {
        let file = File::open(path)?;
        let map = unsafe { Mmap::map(&file) }.map_err(|e| {
            EngineError::ResourceExhausted(format!("mmap of {} failed: {e}", path.display()))
        })?;
        let map = Arc::new(map);

        let mut cur = Cursor::new(&map);
        let magic = cur.take(4)?;
        if magic != MAGIC {
            return Err(EngineError::MalformedModel(format!(
                "bad magic {magic:02x?}"
            )));
        }
        let version = cur.read_u32()?;
        if version != FORMAT_VERSION {
            return Err(EngineError::MalformedModel(format!(
                "unsupported format version {version}"
            )));
        }

        let hparams = HyperParams::read(&mut cur)?;
        let mut vocab = Vec::with_capacity(hparams.n_vocab as usize);
        for _ in 0..hparams.n_vocab {
            let text = cur.read_string(MAX_TOKEN_LEN)?;
            let score = cur.read_f32()?;
            vocab.push(VocabEntry { text, score });
        }

        let n_tensors = cur.read_u32()? as usize;
        let mut tensors = Vec::with_capacity(n_tensors);
        for _ in 0..n_tensors {
            let name = cur.read_string(MAX_NAME_LEN)?;
            let n_dims = cur.read_u32()? as usize;
            if n_dims == 0 || n_dims > 4 {
                return Err(EngineError::MalformedModel(format!(
                    "tensor '{name}' has {n_dims} dims"
                )));
            }
            let mut dims = Vec::with_capacity(n_dims);
            for _ in 0..n_dims {
                dims.push(cur.read_u32()? as usize);
            }
            let dtype = TensorDType::from_tag(cur.read_u32()?)?;
            let data_offset = cur.read_u64()?;
            let data_size = cur.read_u64()?;

            let end = data_offset.checked_add(data_size).ok_or_else(|| {
                EngineError::MalformedModel(format!("tensor '{name}' offset overflow"))
            })?;
            if end > map.len() as u64 {
                return Err(EngineError::MalformedModel(format!(
                    "tensor '{name}' extends past end of file"
                )));
            }
            if data_offset as usize % DATA_ALIGNMENT != 0 {
                return Err(EngineError::MalformedModel(format!(
                    "tensor '{name}' data is not {DATA_ALIGNMENT}-byte aligned"
                )));
            }
            let want = payload_size(&dims, dtype) as u64;
            if want != data_size {
                return Err(EngineError::MalformedModel(format!(
                    "tensor '{name}' payload is {data_size} bytes, expected {want}"
                )));
            }
            tensors.push(TensorEntry {
                name,
                dims,
                dtype,
                data_offset,
                data_size,
            });
        }

        info!(
            path = %path.display(),
            n_tensors = tensors.len(),
            n_vocab = vocab.len(),
            "model file opened"
        );
        Ok(ModelFile {
            map,
            hparams,
            vocab,
            tensors,
        })
    }

    pub fn hparams(&self) -> &HyperParams {
        &self.hparams
    }

    pub fn vocab(&self) -> &[VocabEntry] {
        &self.vocab
    }

    pub fn tensors(&self) -> &[TensorEntry] {
        &self.tensors
    }

    pub fn find(&self, name: &str) -> Option<&TensorEntry> {
        self.tensors.iter().find(|t| t.name == name)
    }

    pub fn tensor_bytes(&self, entry: &TensorEntry) -> &[u8] {
        &self.map[entry.data_offset as usize..(entry.data_offset + entry.data_size) as usize]
    }

    fn data_ref(&self, offset: usize, len: usize) -> DataRef {
        DataRef::Mapped {
            map: Arc::clone(&self.map),
            offset,
            len,
        }
    }

    /// Load a dense (float) tensor, borrowing from the mapping.
    pub fn load_dense(&self, entry: &TensorEntry) -> Result<DenseTensor> {
        let (rows, cols) = entry_shape(entry);
        match entry.dtype {
            TensorDType::Quantized { .. } => Err(EngineError::MalformedModel(format!(
                "tensor '{}' is quantized, expected dense",
                entry.name
            ))),
            dtype => DenseTensor::new(
                rows,
                cols,
                dtype,
                self.data_ref(entry.data_offset as usize, entry.data_size as usize),
            ),
        }
    }

    /// Load any tensor as a weight, splitting quantized payloads into their
    /// codes / scales / zero-points sections.
    pub fn load_weight(&self, entry: &TensorEntry) -> Result<WeightTensor> {
        match entry.dtype {
            TensorDType::Quantized {
                weight,
                scale,
                has_zero_points,
                group_size,
                pack_row,
            } => {
                if entry.dims.len() != 2 {
                    return Err(EngineError::MalformedModel(format!(
                        "quantized tensor '{}' must be 2-D",
                        entry.name
                    )));
                }
                let (rows, cols) = (entry.dims[0], entry.dims[1]);
                let numel = rows * cols;
                let code_bytes = match weight.code_bits() {
                    4 => numel.div_ceil(2),
                    _ => numel,
                };
                let n_blocks = n_scale_blocks(rows, group_size, pack_row);
                let scale_bytes = n_blocks * cols * scale.size_bytes();
                let base = entry.data_offset as usize;

                let codes = self.data_ref(base, code_bytes);
                let scales = self.data_ref(base + code_bytes, scale_bytes);
                let zero_points = if has_zero_points {
                    Some(self.data_ref(base + code_bytes + scale_bytes, n_blocks * cols))
                } else {
                    None
                };
                debug!(tensor = %entry.name, rows, cols, "quantized weight mapped");
                Ok(WeightTensor::Quantized(QuantMatrix::new(
                    rows,
                    cols,
                    weight,
                    scale,
                    group_size,
                    pack_row,
                    codes,
                    scales,
                    zero_points,
                )?))
            }
            _ => Ok(WeightTensor::Dense(self.load_dense(entry)?)),
        }
    }
}

fn entry_shape(entry: &TensorEntry) -> (usize, usize) {
    let numel: usize = entry.dims.iter().product();
    let rows = entry.dims[0];
    (rows, numel / rows.max(1))
}

struct PendingTensor {
    name: String,
    dims: Vec<usize>,
    dtype: TensorDType,
    payload: Vec<u8>,
}

/// In-memory model builder; used by the quantize tool and by tests that
/// synthesize small models.
pub struct ModelWriter {
    hparams: HyperParams,
    vocab: Vec<VocabEntry>,
    tensors: Vec<PendingTensor>,
}

impl ModelWriter {
    pub fn new(hparams: HyperParams, vocab: Vec<VocabEntry>) -> Self {
        Self {
            hparams,
            vocab,
            tensors: Vec::new(),
        }
    }

    pub fn add_raw(&mut self, name: &str, dims: &[usize], dtype: TensorDType, payload: &[u8]) {
        debug_assert_eq!(payload.len(), payload_size(dims, dtype));
        self.tensors.push(PendingTensor {
            name: name.to_string(),
            dims: dims.to_vec(),
            dtype,
            payload: payload.to_vec(),
        });
    }

    pub fn add_f32(&mut self, name: &str, dims: &[usize], data: &[f32]) {
        let mut payload = Vec::with_capacity(data.len() * 4);
        for v in data {
            payload.extend_from_slice(&v.to_le_bytes());
        }
        self.add_raw(name, dims, TensorDType::F32, &payload);
    }

    pub fn add_quantized(&mut self, name: &str, qm: &QuantMatrix) {
        let mut payload =
            Vec::with_capacity(qm.code_bytes().len() + qm.scale_bytes().len());
        payload.extend_from_slice(qm.code_bytes());
        payload.extend_from_slice(qm.scale_bytes());
        if let Some(zp) = qm.zero_point_bytes() {
            payload.extend_from_slice(zp);
        }
        self.tensors.push(PendingTensor {
            name: name.to_string(),
            dims: vec![qm.rows, qm.cols],
            dtype: qm.dtype(),
            payload,
        });
    }

    pub fn write_to(&self, path: &Path) -> Result<()> {
        // Header region: magic + version + hparams + vocab + directory
        let mut head = Vec::new();
        head.extend_from_slice(&MAGIC);
        head.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
        self.hparams.write(&mut head);
        for entry in &self.vocab {
            head.extend_from_slice(&(entry.text.len() as u32).to_le_bytes());
            head.extend_from_slice(entry.text.as_bytes());
            head.extend_from_slice(&entry.score.to_bits().to_le_bytes());
        }
        head.extend_from_slice(&(self.tensors.len() as u32).to_le_bytes());

        let dir_size: usize = self
            .tensors
            .iter()
            .map(|t| 4 + t.name.len() + 4 + 4 * t.dims.len() + 4 + 8 + 8)
            .sum();

        // Assign aligned data offsets following the directory.
        let mut offset = align_up(head.len() + dir_size, DATA_ALIGNMENT);
        let mut offsets = Vec::with_capacity(self.tensors.len());
        for t in &self.tensors {
            offsets.push(offset);
            offset = align_up(offset + t.payload.len(), DATA_ALIGNMENT);
        }

        let mut out = head;
        for (t, &off) in self.tensors.iter().zip(offsets.iter()) {
            out.extend_from_slice(&(t.name.len() as u32).to_le_bytes());
            out.extend_from_slice(t.name.as_bytes());
            out.extend_from_slice(&(t.dims.len() as u32).to_le_bytes());
            for d in &t.dims {
                out.extend_from_slice(&(*d as u32).to_le_bytes());
            }
            out.extend_from_slice(&t.dtype.to_tag().to_le_bytes());
            out.extend_from_slice(&(off as u64).to_le_bytes());
            out.extend_from_slice(&(t.payload.len() as u64).to_le_bytes());
        }
        for (t, &off) in self.tensors.iter().zip(offsets.iter()) {
            out.resize(off, 0);
            out.extend_from_slice(&t.payload);
        }

        std::fs::write(path, &out)?;
        info!(path = %path.display(), bytes = out.len(), "model file written");
        Ok(())
    }
}

fn align_up(v: usize, align: usize) -> usize {
    (v + align - 1) & !(align - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny_hparams() -> HyperParams {
        let mut hp = HyperParams {
            n_vocab: 2,
            n_embd: 4,
            n_head: 1,
            n_kv_head: 1,
            head_dim: 4,
            n_ff: 8,
            n_layer: 1,
            arch_tag: 0,
            rope_theta_bits: 0,
            ctx_max: 16,
            eos_token_id: 1,
        };
        hp.set_rope_theta(10000.0);
        hp
    }

    fn tiny_vocab() -> Vec<VocabEntry> {
        vec![
            VocabEntry {
                text: "<s>".into(),
                score: 0.0,
            },
            VocabEntry {
                text: "</s>".into(),
                score: -1.0,
            },
        ]
    }

    #[test]
    fn round_trips_dense_tensor() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tiny.nbq");

        let mut w = ModelWriter::new(tiny_hparams(), tiny_vocab());
        let data: Vec<f32> = (0..8).map(|i| i as f32 * 0.5).collect();
        w.add_f32("tok_embed.weight", &[2, 4], &data);
        w.write_to(&path).unwrap();

        let f = ModelFile::open(&path).unwrap();
        assert_eq!(f.hparams(), &tiny_hparams());
        assert_eq!(f.vocab().len(), 2);
        assert_eq!(f.vocab()[1].text, "</s>");
        let entry = f.find("tok_embed.weight").unwrap();
        assert_eq!(entry.dims, vec![2, 4]);
        let dense = f.load_dense(entry).unwrap();
        assert_eq!(dense.to_f32(), data);
    }

    #[test]
    fn round_trips_quantized_tensor() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tiny.nbq");

        let src: Vec<f32> = (0..64 * 4).map(|i| ((i as f32) * 0.05).sin()).collect();
        let qm = crate::quant::quantize_matrix(
            &src,
            64,
            4,
            &crate::quant::QuantizeConfig::default(),
        )
        .unwrap();
        let want = qm.dequantize().unwrap();

        let mut w = ModelWriter::new(tiny_hparams(), tiny_vocab());
        w.add_quantized("blk.0.attn_q.weight", &qm);
        w.write_to(&path).unwrap();

        let f = ModelFile::open(&path).unwrap();
        let entry = f.find("blk.0.attn_q.weight").unwrap();
        match f.load_weight(entry).unwrap() {
            WeightTensor::Quantized(q) => {
                assert_eq!(q.dequantize().unwrap(), want);
            }
            WeightTensor::Dense(_) => panic!("expected quantized"),
        }
    }

    #[test]
    fn rejects_bad_magic() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.nbq");
        std::fs::write(&path, b"XXXXGARBAGE").unwrap();
        match ModelFile::open(&path) {
            Err(EngineError::MalformedModel(_)) => {}
            other => panic!("expected MalformedModel, got {other:?}"),
        }
    }

    #[test]
    fn rejects_truncated_tensor() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trunc.nbq");
        let mut w = ModelWriter::new(tiny_hparams(), tiny_vocab());
        w.add_f32("w", &[4, 4], &[0.0; 16]);
        w.write_to(&path).unwrap();

        let bytes = std::fs::read(&path).unwrap();
        std::fs::write(&path, &bytes[..bytes.len() - 8]).unwrap();
        match ModelFile::open(&path) {
            Err(EngineError::MalformedModel(_)) => {}
            other => panic!("expected MalformedModel, got {other:?}"),
        }
    }
}
