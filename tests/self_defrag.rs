//! Files that outgrow their extent slots compact themselves

use anyhow::Result;
use rand::{Rng, SeedableRng};
use slabfs::{Config, SlabError, Volume};

fn pointer_stats(volume: &mut Volume, path: &str) -> Result<(usize, usize)> {
    let inode = volume.file_info(path)?.inode;
    let record = volume.fs_mut().inode(inode)?;
    Ok((record.used_pointers().count(), record.allocated_blocks()))
}

#[test]
fn test_interleaved_growth_keeps_content() -> Result<()> {
    let mut volume = Volume::in_memory(Config::with_geometry(512, 0))?;
    let pointer_count = volume.header().pointer_count as usize;
    assert_eq!(pointer_count, 3);

    let mut rng = rand::rngs::StdRng::seed_from_u64(7);
    let mut expected = [Vec::new(), Vec::new()];
    let names = ["/left.bin", "/right.bin"];

    // alternating appends keep each file from growing in place
    for round in 0..40 {
        for (i, name) in names.iter().enumerate() {
            let chunk: Vec<u8> = (0..1500 + round * 97).map(|_| rng.gen()).collect();
            volume.append_all_bytes(name, &chunk)?;
            expected[i].extend_from_slice(&chunk);
        }
    }

    for (i, name) in names.iter().enumerate() {
        assert_eq!(volume.read_all_bytes(name)?, expected[i], "{} differs", name);
        let (used, blocks) = pointer_stats(&mut volume, name)?;
        assert!(used <= pointer_count, "{} uses {} extents", name, used);
        assert!(blocks * 512 >= expected[i].len());
    }
    Ok(())
}

#[test]
fn test_growth_survives_reopen() -> Result<()> {
    let mut volume = Volume::in_memory(Config::with_geometry(512, 0))?;
    let mut expected = Vec::new();
    for round in 0..30u8 {
        let chunk = vec![round; 4000];
        volume.append_all_bytes("/grow", &chunk)?;
        volume.append_all_bytes(&format!("/spacer{}", round), &[round; 700])?;
        expected.extend_from_slice(&chunk);
    }

    let mut image = Vec::new();
    volume.backup(&mut image)?;
    let mut reopened = Volume::from_storage(Box::new(std::io::Cursor::new(image)), Config::default())?;
    assert_eq!(reopened.read_all_bytes("/grow")?, expected);
    let (used, _) = pointer_stats(&mut reopened, "/grow")?;
    assert!(used <= 3);
    Ok(())
}

#[test]
fn test_file_limit_is_pointer_capacity() -> Result<()> {
    let mut volume = Volume::in_memory(Config::with_geometry(512, 0))?;
    let max = volume.header().max_file_size() as usize;
    assert_eq!(max, 3 * 255 * 512);

    let step = max / 8;
    for i in 0..8 {
        volume.append_all_bytes("/full", &vec![i as u8; step])?;
        volume.append_all_bytes(&format!("/gap{}", i), b"x")?;
    }
    let tail = max - step * 8;
    volume.append_all_bytes("/full", &vec![0xEE; tail])?;
    assert_eq!(volume.file_info("/full")?.length as usize, max);

    let (used, blocks) = pointer_stats(&mut volume, "/full")?;
    assert_eq!(used, 3);
    assert_eq!(blocks, 3 * 255);

    assert!(matches!(
        volume.append_all_bytes("/full", b"!"),
        Err(SlabError::FileTooLarge { .. })
    ));
    let content = volume.read_all_bytes("/full")?;
    assert_eq!(content[step * 3], 3);
    assert_eq!(content[max - 1], 0xEE);
    Ok(())
}
