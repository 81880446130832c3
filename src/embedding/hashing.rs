use sha2::{Digest, Sha256};

/// Signed feature hashing of lowercase word tokens, L2-normalized.
///
/// Texts sharing words land close together under cosine similarity, which
/// is all the local provider promises.
pub fn hash_embedding(text: &str, dims: usize) -> Vec<f32> {
    let mut vector = vec![0.0f32; dims];
    if dims == 0 {
        return vector;
    }

    let tokens = text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase());

    for token in tokens {
        let digest = Sha256::digest(token.as_bytes());
        let mut bucket = [0u8; 8];
        bucket.copy_from_slice(&digest[..8]);
        let index = (u64::from_le_bytes(bucket) % dims as u64) as usize;
        let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
        vector[index] += sign;
    }

    let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for x in &mut vector {
            *x /= norm;
        }
    }
    vector
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::cosine_similarity;

    #[test]
    fn unit_length_and_width() {
        let v = hash_embedding("Tokio schedules tasks", 1536);
        assert_eq!(v.len(), 1536);
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn shared_words_score_higher() {
        let doc = hash_embedding("postgres vector index tuning", 512);
        let close = hash_embedding("tuning the postgres index", 512);
        let far = hash_embedding("banana bread recipe", 512);
        assert!(cosine_similarity(&doc, &close) > cosine_similarity(&doc, &far));
    }

    #[test]
    fn empty_text_is_zero_vector() {
        assert!(hash_embedding("  ...  ", 8).iter().all(|x| *x == 0.0));
    }
}
