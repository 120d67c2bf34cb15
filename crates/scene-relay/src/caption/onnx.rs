//! Encoder/decoder image captioning via ONNX Runtime.
//!
//! Expects a vision encoder that maps `pixel_values [1, 3, S, S]` to hidden
//! states, and a text decoder taking `input_ids [1, T]` plus
//! `encoder_hidden_states` and returning logits `[1, T, vocab]`. BLIP and
//! ViT-GPT2 style exports both fit. Decoding is greedy.

use std::path::Path;

use image::DynamicImage;
use ndarray::{s, Array2, Array4, ArrayD, ArrayViewD};
use ort::session::Session;
use ort::value::Tensor;
use tokenizers::Tokenizer;

use crate::config::OnnxCaptionConfig;
use crate::image_input::LoadedImage;
use crate::types::{RelayError, RelayResult};

use super::Captioner;

const START_TOKEN_CANDIDATES: &[&str] = &["[DEC]", "[CLS]", "<s>", "<|endoftext|>"];
const EOS_TOKEN_CANDIDATES: &[&str] = &["[SEP]", "</s>", "<|endoftext|>"];

/// Captioning model loaded from an encoder, a decoder, and a tokenizer.
pub struct OnnxCaptioner {
    encoder: Session,
    decoder: Session,
    tokenizer: Tokenizer,
    image_size: u32,
    mean: [f32; 3],
    std: [f32; 3],
    start_token: u32,
    eos_token: u32,
    max_new_tokens: usize,
}

impl std::fmt::Debug for OnnxCaptioner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OnnxCaptioner")
            .field("image_size", &self.image_size)
            .field("start_token", &self.start_token)
            .field("eos_token", &self.eos_token)
            .field("max_new_tokens", &self.max_new_tokens)
            .finish_non_exhaustive()
    }
}

impl OnnxCaptioner {
    /// Load the encoder, decoder, and tokenizer named in `config`.
    pub fn new(config: &OnnxCaptionConfig) -> RelayResult<Self> {
        let encoder_path = required_file(config.encoder.as_deref(), "caption.onnx.encoder")?;
        let decoder_path = required_file(config.decoder.as_deref(), "caption.onnx.decoder")?;
        let tokenizer_path = required_file(config.tokenizer.as_deref(), "caption.onnx.tokenizer")?;

        if config.image_size == 0 {
            return Err(RelayError::Config(
                "caption.onnx.image_size must be positive".to_string(),
            ));
        }

        tracing::info!("Loading caption encoder from {}", encoder_path.display());
        let encoder = load_session(encoder_path, config.intra_threads)?;
        tracing::info!("Loading caption decoder from {}", decoder_path.display());
        let decoder = load_session(decoder_path, config.intra_threads)?;

        let tokenizer = Tokenizer::from_file(tokenizer_path).map_err(|e| {
            RelayError::ModelNotAvailable(format!(
                "Failed to load tokenizer {}: {e}",
                tokenizer_path.display()
            ))
        })?;

        let start_token = config
            .decoder_start_token_id
            .or_else(|| first_known_token(&tokenizer, START_TOKEN_CANDIDATES))
            .ok_or_else(|| {
                RelayError::ModelNotAvailable(
                    "tokenizer has no start token; set caption.onnx.decoder_start_token_id"
                        .to_string(),
                )
            })?;
        let eos_token = config
            .eos_token_id
            .or_else(|| first_known_token(&tokenizer, EOS_TOKEN_CANDIDATES))
            .ok_or_else(|| {
                RelayError::ModelNotAvailable(
                    "tokenizer has no end token; set caption.onnx.eos_token_id".to_string(),
                )
            })?;

        tracing::info!(
            "Caption model ready (start token {start_token}, eos token {eos_token}, vocab {})",
            tokenizer.get_vocab_size(true)
        );

        Ok(Self {
            encoder,
            decoder,
            tokenizer,
            image_size: config.image_size,
            mean: config.mean,
            std: config.std,
            start_token,
            eos_token,
            max_new_tokens: config.max_new_tokens,
        })
    }

    fn encode_image(&mut self, img: &DynamicImage) -> RelayResult<ArrayD<f32>> {
        let pixels = preprocess(img, self.image_size, self.mean, self.std);
        let input = Tensor::from_array(pixels)
            .map_err(|e| RelayError::Caption(format!("Failed to create pixel tensor: {e}")))?;

        let outputs = self
            .encoder
            .run(ort::inputs![input])
            .map_err(|e| RelayError::Caption(format!("Encoder inference failed: {e}")))?;

        let hidden = outputs[0]
            .try_extract_array::<f32>()
            .map_err(|e| RelayError::Caption(format!("Failed to extract encoder output: {e}")))?;
        Ok(hidden.to_owned())
    }

    fn next_token_logits(
        &mut self,
        hidden: &ArrayD<f32>,
        tokens: &[u32],
    ) -> RelayResult<Vec<f32>> {
        let ids: Vec<i64> = tokens.iter().map(|&t| t as i64).collect();
        let ids = Array2::from_shape_vec((1, ids.len()), ids)
            .map_err(|e| RelayError::Caption(format!("Bad input_ids shape: {e}")))?;

        let ids_value = Tensor::from_array(ids)
            .map_err(|e| RelayError::Caption(format!("Failed to create input_ids tensor: {e}")))?;
        let hidden_value = Tensor::from_array(hidden.clone()).map_err(|e| {
            RelayError::Caption(format!("Failed to create hidden state tensor: {e}"))
        })?;

        let outputs = self
            .decoder
            .run(ort::inputs![
                "input_ids" => ids_value,
                "encoder_hidden_states" => hidden_value
            ])
            .map_err(|e| RelayError::Caption(format!("Decoder inference failed: {e}")))?;

        let logits = outputs[0]
            .try_extract_array::<f32>()
            .map_err(|e| RelayError::Caption(format!("Failed to extract logits: {e}")))?;
        last_position_logits(&logits)
    }

    fn instruction_tokens(&self, instruction: Option<&str>) -> RelayResult<Vec<u32>> {
        let Some(text) = instruction.map(str::trim).filter(|t| !t.is_empty()) else {
            return Ok(Vec::new());
        };
        let encoding = self
            .tokenizer
            .encode(text, false)
            .map_err(|e| RelayError::Caption(format!("Failed to tokenize instruction: {e}")))?;
        Ok(encoding
            .get_ids()
            .iter()
            .copied()
            .filter(|&id| id != self.start_token && id != self.eos_token)
            .collect())
    }
}

impl Captioner for OnnxCaptioner {
    fn name(&self) -> &str {
        "onnx"
    }

    fn caption(&mut self, image: &LoadedImage, instruction: Option<&str>) -> RelayResult<String> {
        let hidden = self.encode_image(&image.image)?;
        tracing::debug!("Encoder hidden states {:?}", hidden.shape());

        let mut tokens = vec![self.start_token];
        tokens.extend(self.instruction_tokens(instruction)?);
        let prefix_len = tokens.len();

        for _ in 0..self.max_new_tokens {
            let logits = self.next_token_logits(&hidden, &tokens)?;
            let next = greedy_token(&logits)
                .ok_or_else(|| RelayError::Caption("Decoder returned empty logits".to_string()))?;
            if next == self.eos_token {
                break;
            }
            tokens.push(next);
        }

        let generated = &tokens[prefix_len..];
        let caption = self
            .tokenizer
            .decode(generated, true)
            .map_err(|e| RelayError::Caption(format!("Failed to decode caption: {e}")))?;
        let caption = caption.trim().to_string();
        tracing::info!("Caption ({} tokens): {caption}", generated.len());
        Ok(caption)
    }
}

/// Resize to `size`x`size` and normalize into an NCHW tensor `[1, 3, size, size]`.
pub fn preprocess(img: &DynamicImage, size: u32, mean: [f32; 3], std: [f32; 3]) -> Array4<f32> {
    let resized = img.resize_exact(size, size, image::imageops::FilterType::Triangle);
    let rgb = resized.to_rgb8();

    let mut tensor = Array4::<f32>::zeros((1, 3, size as usize, size as usize));
    for y in 0..size {
        for x in 0..size {
            let pixel = rgb.get_pixel(x, y);
            for c in 0..3usize {
                let val = pixel[c] as f32 / 255.0;
                tensor[[0, c, y as usize, x as usize]] = (val - mean[c]) / std[c];
            }
        }
    }
    tensor
}

/// Logits for the last sequence position of a `[1, T, vocab]` or `[T, vocab]`
/// output.
fn last_position_logits(logits: &ArrayViewD<'_, f32>) -> RelayResult<Vec<f32>> {
    let shape = logits.shape();
    let row = match shape.len() {
        3 if shape[1] > 0 => logits.slice(s![0, shape[1] - 1, ..]).to_vec(),
        2 if shape[0] > 0 => logits.slice(s![shape[0] - 1, ..]).to_vec(),
        _ => {
            return Err(RelayError::Caption(format!(
                "Unexpected decoder output shape {shape:?}"
            )))
        }
    };
    Ok(row)
}

/// Index of the highest logit.
fn greedy_token(logits: &[f32]) -> Option<u32> {
    logits
        .iter()
        .enumerate()
        .max_by(|(_, a), (_, b)| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal))
        .map(|(idx, _)| idx as u32)
}

fn first_known_token(tokenizer: &Tokenizer, candidates: &[&str]) -> Option<u32> {
    candidates.iter().find_map(|t| tokenizer.token_to_id(t))
}

fn required_file<'a>(path: Option<&'a Path>, key: &str) -> RelayResult<&'a Path> {
    let path =
        path.ok_or_else(|| RelayError::ModelNotAvailable(format!("{key} is not configured")))?;
    if !path.is_file() {
        return Err(RelayError::ModelNotAvailable(format!(
            "{key} not found at {}",
            path.display()
        )));
    }
    Ok(path)
}

fn load_session(path: &Path, threads: usize) -> RelayResult<Session> {
    Session::builder()
        .and_then(|b| b.with_intra_threads(threads.max(1)))
        .and_then(|b| b.commit_from_file(path))
        .map_err(|e| {
            RelayError::ModelNotAvailable(format!(
                "Failed to load ONNX model {}: {e}",
                path.display()
            ))
        })
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use ndarray::{Array3, IxDyn};

    use super::*;

    #[test]
    fn test_preprocess_shape_and_normalization() {
        let white = DynamicImage::ImageRgb8(image::RgbImage::from_pixel(
            5,
            3,
            image::Rgb([255, 255, 255]),
        ));
        let mean = [0.5, 0.5, 0.5];
        let std = [0.5, 0.25, 0.5];
        let tensor = preprocess(&white, 4, mean, std);

        assert_eq!(tensor.shape(), &[1, 3, 4, 4]);
        assert!((tensor[[0, 0, 0, 0]] - 1.0).abs() < 1e-6);
        assert!((tensor[[0, 1, 3, 3]] - 2.0).abs() < 1e-6);
    }

    #[test]
    fn test_greedy_token() {
        assert_eq!(greedy_token(&[0.1, 3.0, -2.0, 2.9]), Some(1));
        assert_eq!(greedy_token(&[]), None);
    }

    #[test]
    fn test_last_position_logits() {
        let mut logits = Array3::<f32>::zeros((1, 2, 3));
        logits[[0, 1, 2]] = 7.0;
        let dynamic = logits.into_dyn();
        assert_eq!(
            last_position_logits(&dynamic.view()).unwrap(),
            vec![0.0, 0.0, 7.0]
        );

        let flat = ArrayD::<f32>::zeros(IxDyn(&[4]));
        assert!(last_position_logits(&flat.view()).is_err());
    }

    fn word_level_tokenizer(vocab: &str) -> Tokenizer {
        let json = format!(
            r#"{{
                "version": "1.0",
                "truncation": null,
                "padding": null,
                "added_tokens": [],
                "normalizer": null,
                "pre_tokenizer": null,
                "post_processor": null,
                "decoder": null,
                "model": {{ "type": "WordLevel", "vocab": {vocab}, "unk_token": "[UNK]" }}
            }}"#
        );
        json.parse().unwrap()
    }

    #[test]
    fn test_blip_tokenizer_starts_from_dec() {
        let tokenizer = word_level_tokenizer(
            r#"{ "[UNK]": 100, "[CLS]": 101, "[SEP]": 102, "[DEC]": 30522 }"#,
        );
        assert_eq!(
            first_known_token(&tokenizer, START_TOKEN_CANDIDATES),
            Some(30522)
        );
        assert_eq!(first_known_token(&tokenizer, EOS_TOKEN_CANDIDATES), Some(102));
    }

    #[test]
    fn test_gpt2_tokenizer_uses_endoftext() {
        let tokenizer = word_level_tokenizer(r#"{ "[UNK]": 0, "<|endoftext|>": 50256 }"#);
        assert_eq!(
            first_known_token(&tokenizer, START_TOKEN_CANDIDATES),
            Some(50256)
        );
        assert_eq!(
            first_known_token(&tokenizer, EOS_TOKEN_CANDIDATES),
            Some(50256)
        );
    }

    #[test]
    fn test_unconfigured_model() {
        let err = OnnxCaptioner::new(&OnnxCaptionConfig::default()).unwrap_err();
        assert!(matches!(err, RelayError::ModelNotAvailable(ref m) if m.contains("encoder")));
    }

    #[test]
    fn test_missing_model_files() {
        let config = OnnxCaptionConfig {
            encoder: Some(PathBuf::from("/nonexistent/vision_model.onnx")),
            decoder: Some(PathBuf::from("/nonexistent/text_decoder.onnx")),
            tokenizer: Some(PathBuf::from("/nonexistent/tokenizer.json")),
            ..OnnxCaptionConfig::default()
        };
        let err = OnnxCaptioner::new(&config).unwrap_err();
        assert!(matches!(err, RelayError::ModelNotAvailable(_)));
    }
}
