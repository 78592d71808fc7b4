//! Placeholder images for when the engine is unavailable.

use atelier_core::generation::ResolvedGeneration;

use crate::images::{GeneratedImageRef, ImageSource};

const MOCK_IMAGE_BASE: &str = "https://picsum.photos/seed";

/// One placeholder per batch slot, seeded `seed + i` so a batch is
/// visually distinct and reproducible.
pub fn mock_images(generation: &ResolvedGeneration) -> Vec<GeneratedImageRef> {
    let size = generation.size;
    (0..usize::try_from(generation.batch_size).unwrap_or(0))
        .map(|i| {
            let seed = generation.image_seed(i);
            GeneratedImageRef {
                id: format!("mock_{seed}_{i}"),
                url: format!("{MOCK_IMAGE_BASE}/{seed}/{}/{}", size.width, size.height),
                seed,
                file_size: None,
                width: size.width,
                height: size.height,
                source: ImageSource::Mock,
                filename: None,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use atelier_core::generation::{resolve_request, GenerationRequest};

    use super::*;

    #[test]
    fn one_image_per_batch_slot_with_consecutive_seeds() {
        let request: GenerationRequest = serde_json::from_value(serde_json::json!({
            "prompt": "p", "model": "m", "sampler": "s",
            "size": "768x512", "batchSize": 3, "seed": 100
        }))
        .unwrap();
        let generation = resolve_request(&request).unwrap();

        let images = mock_images(&generation);
        assert_eq!(images.len(), 3);
        assert_eq!(images[0].url, "https://picsum.photos/seed/100/768/512");
        assert_eq!(images[2].seed, 102);
        assert!(images.iter().all(|i| i.source == ImageSource::Mock));
    }
}
