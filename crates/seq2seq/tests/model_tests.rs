use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use seq2seq::{DecodeStrategy, Seq2SeqConfig, TranslationModel};

fn build_config() -> Seq2SeqConfig {
    Seq2SeqConfig {
        vocab_size: 24,
        d_model: 16,
        n_layers: 2,
        n_heads: 2,
        ff_dim: 32,
        max_positions: 12,
        dropout: 0.1,
        sos_id: 1,
        eos_id: 2,
        pad_id: 0,
    }
}

fn sample_source() -> Result<Tensor> {
    Ok(Tensor::new(
        &[[1u32, 5, 6, 7, 2, 0], [1, 9, 10, 2, 0, 0]],
        &Device::Cpu,
    )?)
}

#[test]
fn forward_produces_logits() -> Result<()> {
    let model = TranslationModel::new(build_config(), &Device::Cpu)?;
    let targets = Tensor::new(&[[1u32, 3, 4, 2], [1, 8, 2, 0]], &Device::Cpu)?;

    let logits = model.forward(&sample_source()?, &targets)?;

    assert_eq!(logits.dims(), &[2, 4, 24]);
    assert_eq!(logits.dtype(), DType::F32);
    Ok(())
}

#[test]
fn eval_mode_forward_is_deterministic() -> Result<()> {
    let model = TranslationModel::new(build_config(), &Device::Cpu)?;
    model.set_training(false);
    let targets = Tensor::new(&[[1u32, 3, 4, 2], [1, 8, 2, 0]], &Device::Cpu)?;

    let first = model.forward(&sample_source()?, &targets)?;
    let second = model.forward(&sample_source()?, &targets)?;

    let diff = (first - second)?.abs()?.sum_all()?.to_vec0::<f32>()?;
    assert_eq!(diff, 0.0);
    Ok(())
}

#[test]
fn parameters_are_named_and_sorted() -> Result<()> {
    let model = TranslationModel::new(build_config(), &Device::Cpu)?;
    let params = model.named_parameters()?;

    let names: Vec<&str> = params.iter().map(|(name, _)| name.as_str()).collect();
    assert!(names.contains(&"shared.embed_tokens.weight"));
    assert!(names.contains(&"encoder.embed_positions.weight"));
    assert!(names.contains(&"decoder.layers.1.encoder_attn.q_proj.weight"));
    let mut sorted = names.clone();
    sorted.sort();
    assert_eq!(names, sorted);
    assert!(model.num_parameters()? > 0);
    Ok(())
}

#[test]
fn rejects_sequences_longer_than_position_table() -> Result<()> {
    let model = TranslationModel::new(build_config(), &Device::Cpu)?;
    let source = Tensor::zeros((1, 13), DType::U32, &Device::Cpu)?;
    let targets = Tensor::zeros((1, 2), DType::U32, &Device::Cpu)?;
    assert!(model.forward(&source, &targets).is_err());
    Ok(())
}

#[test]
fn greedy_generation_starts_with_sos_and_respects_max_len() -> Result<()> {
    let model = TranslationModel::new(build_config(), &Device::Cpu)?;
    model.set_training(false);

    let outputs = model.generate(&sample_source()?, DecodeStrategy::Greedy, 6)?;

    assert_eq!(outputs.len(), 2);
    for sequence in outputs {
        assert_eq!(sequence[0], 1);
        assert!(sequence.len() <= 6);
        assert!(sequence.iter().all(|id| (*id as usize) < 24));
    }
    Ok(())
}

#[test]
fn beam_generation_returns_one_sequence_per_row() -> Result<()> {
    let model = TranslationModel::new(build_config(), &Device::Cpu)?;
    model.set_training(false);

    let outputs = model.generate(&sample_source()?, DecodeStrategy::Beam(3), 5)?;

    assert_eq!(outputs.len(), 2);
    for sequence in outputs {
        assert_eq!(sequence[0], 1);
        assert!(sequence.len() >= 2 && sequence.len() <= 5);
    }
    Ok(())
}
