use speech_emotion_core::audio::Waveform;
use speech_emotion_core::augment::{AugmentConfig, Augmenter};
use speech_emotion_core::classifier::{Classifier, ClassifierConfig, LabeledSet, LstmClassifier};
use speech_emotion_core::dataset::DatasetBuilder;
use speech_emotion_core::embedding::EmbeddingModel;
use speech_emotion_core::labels::LabelCodec;
use speech_emotion_core::normalize::SequenceNormalizer;
use speech_emotion_core::pipeline::{PipelineConfig, TrainingPipeline};
use speech_emotion_core::testing::{write_tone, FrameStatsModel};

fn toy_corpus() -> tempfile::TempDir {
    let dir = tempfile::tempdir().expect("tempdir");
    write_tone(&dir.path().join("03-01-03-01-01-01-01.wav"), 300.0, 0.5, 2.0);
    write_tone(&dir.path().join("03-01-05-01-01-01-02.wav"), 1200.0, 0.2, 2.5);
    dir
}

fn toy_classifier_config() -> ClassifierConfig {
    ClassifierConfig {
        first_units: 16,
        second_units: 8,
        dense_units: 8,
        dropout: 0.0,
        learning_rate: 0.01,
        batch_size: 4,
        max_epochs: 80,
        early_stopping_patience: 80,
        ..Default::default()
    }
}

#[test]
fn two_file_corpus_trains_above_chance() {
    let corpus = toy_corpus();
    let model = FrameStatsModel;
    let augmenter = Augmenter::new(AugmentConfig::default()).expect("augmenter");

    let (dataset, report) = DatasetBuilder::new(&model)
        .with_augmenter(augmenter)
        .build(corpus.path())
        .expect("dataset");
    assert_eq!(dataset.len(), 8);
    assert_eq!(report.files_processed, 2);

    let max_frames = dataset.max_frames();
    let (sequences, labels) = dataset.into_columns();
    assert_eq!(labels.iter().filter(|l| *l == "03").count(), 4);
    assert_eq!(labels.iter().filter(|l| *l == "05").count(), 4);

    let mut normalizer = SequenceNormalizer::new();
    let scaled = normalizer.fit_transform(&sequences).expect("normalize");
    assert_eq!(normalizer.state().expect("fitted").max_len, max_frames);
    assert_eq!(scaled.max_len(), max_frames);

    let codec = LabelCodec::fit(&labels).expect("codec");
    assert_eq!(codec.len(), 2);
    let encoded = codec.encode_all(&labels).expect("encode");

    let mut classifier = LstmClassifier::new(toy_classifier_config()).expect("classifier");
    classifier
        .fit(LabeledSet::new(&scaled, &encoded), None, codec.len())
        .expect("fit");
    let eval = classifier
        .evaluate(LabeledSet::new(&scaled, &encoded))
        .expect("evaluate");
    assert!(eval.accuracy > 0.5, "accuracy {}", eval.accuracy);
}

#[test]
fn fitted_pipeline_recognises_a_new_happy_recording() {
    let corpus = toy_corpus();
    let classifier = LstmClassifier::new(toy_classifier_config()).expect("classifier");
    let (fitted, summary) =
        TrainingPipeline::new(FrameStatsModel, classifier, PipelineConfig::default())
            .run(corpus.path())
            .expect("train");
    assert_eq!(summary.classes, ["03", "05"]);
    assert_eq!(summary.build.rows, 8);

    let unseen = tempfile::tempdir().expect("tempdir");
    let path = unseen.path().join("03-01-03-02-02-01-09.wav");
    write_tone(&path, 310.0, 0.45, 1.7);

    let prediction = fitted.predict_file(&path).expect("predict");
    assert_eq!(prediction.label, "03");
    assert_eq!(prediction.emotion, "happy");
    assert!((0.0..=100.0).contains(&prediction.confidence_percent));
    let total: f32 = prediction.probabilities.iter().sum();
    assert!((total - 1.0).abs() < 1e-4);
}

#[test]
fn long_inputs_are_truncated_to_the_training_length() {
    let corpus = toy_corpus();
    let classifier = LstmClassifier::new(ClassifierConfig {
        max_epochs: 2,
        ..toy_classifier_config()
    })
    .expect("classifier");
    let (fitted, _) = TrainingPipeline::new(FrameStatsModel, classifier, PipelineConfig::default())
        .run(corpus.path())
        .expect("train");

    let long = Waveform::new(vec![0.25; 16_000 * 10], 16_000);
    let sequence = FrameStatsModel.embed(&long).expect("embed");
    assert!(sequence.num_frames() > fitted.scaler().max_len);

    let padded = fitted.scaler().transform(&sequence).expect("transform");
    assert_eq!(padded.max_len(), fitted.scaler().max_len);
    assert!(fitted.predict_waveform(&long).is_ok());
}

#[cfg(feature = "onnx")]
#[test]
fn yamnet_backend_smoke() {
    use speech_emotion_core::embedding::{YamnetEmbedder, YAMNET_EMBEDDING_WIDTH};
    use std::path::Path;

    let Ok(model_path) = std::env::var("SER_YAMNET_MODEL") else {
        eprintln!("SER_YAMNET_MODEL not set, skipping YAMNet smoke test");
        return;
    };
    let embedder = YamnetEmbedder::new(Path::new(&model_path), 1).expect("load YAMNet");

    let samples: Vec<f32> = (0..32_000)
        .map(|i| 0.3 * (2.0 * std::f32::consts::PI * 440.0 * i as f32 / 16_000.0).sin())
        .collect();
    let sequence = embedder
        .embed(&Waveform::new(samples, 16_000))
        .expect("embed");
    assert_eq!(sequence.width(), YAMNET_EMBEDDING_WIDTH);
    assert!(sequence.num_frames() >= 1);
}
