//! Compressed facial animation batches
//!
//! A face batch is a MessagePack document (structs encoded positionally) that is
//! zlib/deflate compressed on the wire. Each decoded entry becomes one
//! single-frame [`FrameRecord`] starting at `start_frame + i`.

use std::io::{Read, Write};

use flate2::Compression;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use serde::{Deserialize, Serialize};

use super::{CodecError, quantized};
use crate::types::{FaceFrame, FrameRecord};

/// Upper bound on a decompressed batch.
pub const MAX_DECOMPRESSED_BYTES: usize = 8 * 1024 * 1024;

#[derive(Debug, Serialize, Deserialize)]
struct WireFaceBatch {
    start_frame: u32,
    frames: Vec<WireFaceFrame>,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireFaceFrame {
    blendshapes: Vec<i16>,
    joint_translate: Vec<f32>,
    joint_rotate: Vec<i16>,
    mesh_indices: Vec<u32>,
    mesh_weights: Vec<i16>,
}

/// Decompress and decode a face batch.
pub fn decode_batch(payload: &[u8]) -> Result<Vec<FrameRecord<FaceFrame>>, CodecError> {
    if payload.is_empty() {
        return Err(CodecError::Truncated { expected: 1, found: 0 });
    }

    let raw = inflate(payload)?;
    let batch: WireFaceBatch =
        rmp_serde::from_slice(&raw).map_err(|e| CodecError::Schema { details: e.to_string() })?;

    let mut records = Vec::with_capacity(batch.frames.len());
    for (offset, frame) in batch.frames.into_iter().enumerate() {
        if frame.mesh_indices.len() != frame.mesh_weights.len() {
            return Err(CodecError::FieldMismatch {
                field: "mesh_weights",
                expected: frame.mesh_indices.len(),
                found: frame.mesh_weights.len(),
            });
        }

        let index = batch
            .start_frame
            .checked_add(offset as u32)
            .ok_or(CodecError::FrameOverflow { start: batch.start_frame })?;

        records.push(FrameRecord::single(
            index,
            FaceFrame {
                blendshapes: quantized::decode(&frame.blendshapes),
                joint_translate: frame.joint_translate,
                joint_rotate: quantized::decode(&frame.joint_rotate),
                mesh_indices: frame.mesh_indices,
                mesh_weights: quantized::decode(&frame.mesh_weights),
            },
        ));
    }

    Ok(records)
}

/// Encode and compress face frames starting at `start_frame`.
pub fn encode_batch(start_frame: u32, frames: &[FaceFrame]) -> Result<Vec<u8>, CodecError> {
    let batch = WireFaceBatch {
        start_frame,
        frames: frames
            .iter()
            .map(|frame| WireFaceFrame {
                blendshapes: quantized::encode(&frame.blendshapes),
                joint_translate: frame.joint_translate.clone(),
                joint_rotate: quantized::encode(&frame.joint_rotate),
                mesh_indices: frame.mesh_indices.clone(),
                mesh_weights: quantized::encode(&frame.mesh_weights),
            })
            .collect(),
    };

    let raw =
        rmp_serde::to_vec(&batch).map_err(|e| CodecError::Schema { details: e.to_string() })?;

    let mut encoder = ZlibEncoder::new(Vec::with_capacity(raw.len() / 2), Compression::fast());
    encoder.write_all(&raw).map_err(|e| CodecError::Decompress { details: e.to_string() })?;
    encoder.finish().map_err(|e| CodecError::Decompress { details: e.to_string() })
}

fn inflate(payload: &[u8]) -> Result<Vec<u8>, CodecError> {
    let mut out = Vec::with_capacity(payload.len() * 4);
    ZlibDecoder::new(payload)
        .take(MAX_DECOMPRESSED_BYTES as u64 + 1)
        .read_to_end(&mut out)
        .map_err(|e| CodecError::Decompress { details: e.to_string() })?;

    if out.len() > MAX_DECOMPRESSED_BYTES {
        return Err(CodecError::TooLarge { limit: MAX_DECOMPRESSED_BYTES });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_frame(seed: f32) -> FaceFrame {
        FaceFrame {
            blendshapes: vec![seed, -seed, 0.5],
            joint_translate: vec![1.5, -2.0, 0.25],
            joint_rotate: vec![0.0, 0.7071, 0.0, 0.7071],
            mesh_indices: vec![3, 17],
            mesh_weights: vec![0.25, 0.75],
        }
    }

    #[test]
    fn batch_expands_to_one_record_per_frame() {
        let frames: Vec<_> = (0..24).map(|i| sample_frame(i as f32 / 24.0)).collect();
        let payload = encode_batch(0, &frames).unwrap();

        let records = decode_batch(&payload).unwrap();
        assert_eq!(records.len(), 24);
        for (i, record) in records.iter().enumerate() {
            assert_eq!(record.start_frame, i as u32);
            assert_eq!(record.end_frame, i as u32 + 1);
        }

        let last = &records[23].payload;
        assert!((last.blendshapes[0] - 23.0 / 24.0).abs() <= 1.0 / quantized::SCALE);
        assert_eq!(last.joint_translate, vec![1.5, -2.0, 0.25]);
        assert_eq!(last.mesh_indices, vec![3, 17]);
    }

    #[test]
    fn garbage_is_a_decompress_error() {
        let err = decode_batch(b"definitely not zlib").unwrap_err();
        assert!(matches!(err, CodecError::Decompress { .. }));
    }

    #[test]
    fn empty_payload_is_truncated() {
        assert!(matches!(decode_batch(&[]), Err(CodecError::Truncated { .. })));
    }

    #[test]
    fn valid_zlib_with_wrong_schema_is_rejected() {
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::fast());
        encoder.write_all(&rmp_serde::to_vec(&("wrong", 1u8)).unwrap()).unwrap();
        let payload = encoder.finish().unwrap();

        assert!(matches!(decode_batch(&payload), Err(CodecError::Schema { .. })));
    }

    #[test]
    fn mismatched_mesh_pairs_are_rejected() {
        let mut frame = sample_frame(0.1);
        frame.mesh_weights.pop();
        let payload = encode_batch(5, &[frame]).unwrap();

        assert!(matches!(
            decode_batch(&payload),
            Err(CodecError::FieldMismatch { field: "mesh_weights", expected: 2, found: 1 })
        ));
    }
}
