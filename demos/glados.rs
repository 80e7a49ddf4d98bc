use std::path::PathBuf;
use std::time::Instant;

use vits_tts::{
    engines::vits::{VitsEngine, VitsModelParams},
    SynthesisEngine,
};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let mut engine = VitsEngine::new();
    let model_path = PathBuf::from("models/glados.onnx");
    let params = VitsModelParams {
        use_cuda: std::env::var_os("VITS_USE_CUDA").is_some(),
        espeak_library_dir: std::env::var_os("ESPEAK_NG_PATH").map(PathBuf::from),
        ..Default::default()
    };

    let load_start = Instant::now();
    engine.load_model_with_params(&model_path, params)?;
    println!("Model loaded in {:.2?}", load_start.elapsed());

    let text = "Hello world. How are you?";

    let synth_start = Instant::now();
    let utterance = engine.generate_utterance(text, None)?;
    let synth_dur = synth_start.elapsed();

    let audio_duration = utterance.audio.duration_secs();
    let speedup = audio_duration / synth_dur.as_secs_f64();
    println!(
        "Synthesized {} sentences, {:.2}s audio in {:.2?} ({:.1}x real-time)",
        utterance.sentence_samples.len(),
        audio_duration,
        synth_dur,
        speedup
    );
    for warning in &utterance.warnings {
        println!("warning: {warning}");
    }

    utterance.audio.write_wav_pcm16(&PathBuf::from("output.wav"))?;
    println!("Saved to output.wav");

    engine.unload_model();
    Ok(())
}
