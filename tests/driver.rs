mod common;

use aerialbooth::{
    driver::{BatchDriver, Preset},
    image_io,
    view::ViewMode,
    worklist::{Example, Homography, Worklist},
};
use common::{gradient, small_config, write_image, ToyBackend, FAIL_MARKER};
use std::path::Path;

fn example(root: &Path, id: &str, prompt: &str) -> Example {
    let image = root.join("dataset").join(format!("{id}.png"));
    write_image(&image, &gradient(64, 64, 50));
    Example::new(id.to_string(), image, prompt.to_string())
        .with_view_modes(vec![ViewMode::Aerial, ViewMode::Side])
}

#[test]
fn a_failing_example_does_not_stop_the_batch() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let out = dir.path().join("exp_outputs");
    let worklist = Worklist::new(vec![
        example(dir.path(), "city27", "A bustling city street."),
        example(dir.path(), "human8", &format!("A scientist {FAIL_MARKER}")),
        example(dir.path(), "nature16", "A cave with stalactites."),
    ])?;
    let mut driver = BatchDriver::new(ToyBackend::new(), small_config(), Preset::Noisy, &out)?;
    let report = driver.run(&worklist);
    assert_eq!(report.succeeded, vec!["city27", "nature16"]);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0, "human8");
    assert!(!report.is_success());
    assert!(!out.join("human8").exists());
    assert!(!out.join("human8.partial").exists());
    for id in ["city27", "nature16"] {
        for name in ["aerial1.png", "aerial2.png", "side1.png", "side2.png"] {
            assert!(out.join(id).join(name).exists(), "{id}/{name}");
        }
        assert!(!out.join(id).join("bottom1.png").exists());
        assert!(!out.join(format!("{id}.partial")).exists());
    }
    Ok(())
}

#[test]
fn missing_assets_are_reported() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let out = dir.path().join("out");
    let missing = Example::new("ghost", dir.path().join("ghost.png"), "nothing here");
    let no_homography = example(dir.path(), "indoor2", "A modern living room.")
        .with_homography(Homography::Single(dir.path().join("zero/outputindoor2.png")));
    let worklist = Worklist::new(vec![missing, no_homography])?;
    let mut driver = BatchDriver::new(ToyBackend::new(), small_config(), Preset::Noisy, &out)?;
    let report = driver.run(&worklist);
    assert!(report.succeeded.is_empty());
    let kinds: Vec<_> = report.failed.iter().map(|(_, e)| e.kind()).collect();
    assert_eq!(kinds, vec!["MissingAssetError", "MissingAssetError"]);
    assert!(!out.join("indoor2").exists());
    Ok(())
}

#[test]
fn per_view_preset_crops_the_homography_sheet() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let out = dir.path().join("avg_out");
    let sheet = dir.path().join("sheets/traffic24.png");
    write_image(&sheet, &gradient(128, 192, 0));
    let worklist = Worklist::new(vec![example(dir.path(), "traffic24", "An airport.")
        .with_homography(Homography::Sheet(sheet))
        .with_view_modes(ViewMode::RENDER_ORDER.to_vec())])?;
    let config = aerialbooth::config::PipelineConfig { sample_count: 1, ..small_config() };
    let mut driver = BatchDriver::new(ToyBackend::new(), config, Preset::PerView, &out)?;
    let report = driver.run(&worklist);
    assert!(report.is_success(), "{:?}", report.failed);
    for view in ViewMode::ALL {
        assert!(out.join("traffic24").join(view.sample_file_name(1)).exists());
    }
    Ok(())
}

fn write_video_frames(dir: &Path, count: u8) -> anyhow::Result<Vec<std::path::PathBuf>> {
    for index in 0..count {
        write_image(dir.join(format!("frame_{index}.png")), &gradient(64, 64, index * 40));
    }
    Ok(aerialbooth::driver::frames_in(dir)?)
}

fn encoded(path: &Path) -> anyhow::Result<tch::Tensor> {
    Ok(image_io::preprocess(&image::open(path)?.to_rgb8())?)
}

#[test]
fn temporal_frames_are_chained() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let frames = write_video_frames(&dir.path().join("panda"), 3)?;
    let out = dir.path().join("res");
    let mut driver = BatchDriver::new(ToyBackend::new(), small_config(), Preset::Temporal, &out)?;
    let report = driver.run_temporal(&frames, "A panda eating bamboo.", ViewMode::Aerial, None, &out);
    assert!(report.is_success(), "{:?}", report.failed);
    assert_eq!(report.succeeded, vec!["frame_0", "frame_1", "frame_2"]);
    for index in 0..3 {
        let frame = image::open(out.join(format!("generated_image_{index}.png")))?;
        assert_eq!((frame.width(), frame.height()), (64, 64));
    }
    assert!(!out.join("generated_image_3.png").exists());

    // Every frame encodes its source then its homography, here the source too.
    let inputs = driver.pipeline().backend().take_encoded_images();
    assert_eq!(inputs.len(), 6);
    let first = image_io::preprocess(&image_io::load_rgb(&frames[0], 64, 64)?)?;
    assert!(inputs[0].equal(&first));
    assert!(inputs[2].equal(&encoded(&out.join("generated_image_0.png"))?));
    assert!(inputs[4].equal(&encoded(&out.join("generated_image_1.png"))?));
    assert!(!inputs[2].equal(&image_io::preprocess(&image_io::load_rgb(&frames[1], 64, 64)?)?));
    Ok(())
}

#[test]
fn a_failed_frame_keeps_the_previous_output_as_source() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let frames = write_video_frames(&dir.path().join("panda"), 3)?;
    let homographies = dir.path().join("homographies");
    for index in [0, 2] {
        write_image(homographies.join(format!("frame_{index}.png")), &gradient(64, 64, 255));
    }
    let out = dir.path().join("res");
    let mut driver = BatchDriver::new(ToyBackend::new(), small_config(), Preset::Temporal, &out)?;
    let report =
        driver.run_temporal(&frames, "A panda eating bamboo.", ViewMode::Side, Some(&homographies), &out);
    assert_eq!(report.succeeded, vec!["frame_0", "frame_2"]);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0, "frame_1");
    assert_eq!(report.failed[0].1.kind(), "MissingAssetError");
    assert!(out.join("generated_image_0.png").exists());
    assert!(!out.join("generated_image_1.png").exists());
    assert!(out.join("generated_image_2.png").exists());

    // Frame 1 stops before encoding anything, frame 2 starts from output 0.
    let inputs = driver.pipeline().backend().take_encoded_images();
    assert_eq!(inputs.len(), 4);
    assert!(inputs[1].equal(&encoded(&homographies.join("frame_0.png"))?));
    assert!(inputs[2].equal(&encoded(&out.join("generated_image_0.png"))?));
    assert!(inputs[3].equal(&encoded(&homographies.join("frame_2.png"))?));
    Ok(())
}

#[test]
fn temporal_preset_rejects_worklists() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let out = dir.path().join("out");
    let worklist = Worklist::new(vec![
        example(dir.path(), "city27", "A bustling city street."),
        example(dir.path(), "nature16", "A cave with stalactites."),
    ])?;
    let mut driver = BatchDriver::new(ToyBackend::new(), small_config(), Preset::Temporal, &out)?;
    let report = driver.run(&worklist);
    assert!(report.succeeded.is_empty());
    let kinds: Vec<_> = report.failed.iter().map(|(_, e)| e.kind()).collect();
    assert_eq!(kinds, vec!["InvalidInputError", "InvalidInputError"]);
    assert!(!out.join("city27").exists());
    assert!(!out.join("city27.partial").exists());
    assert!(driver.pipeline().backend().take_encoded_images().is_empty());
    Ok(())
}

#[test]
fn invalid_configurations_are_rejected() {
    let config = aerialbooth::config::PipelineConfig { width: 60, ..small_config() };
    assert!(BatchDriver::new(ToyBackend::new(), config, Preset::Noisy, "out").is_err());
}
