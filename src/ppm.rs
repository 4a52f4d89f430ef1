use std::{
    fs::File,
    io::{self, BufWriter, Write},
    path::Path,
};

/// Writes a raw-byte PPM (P6) image: `P6\n{W} {H}\n255\n` followed by
/// `W * H` RGB triplets.
pub fn write_ppm(path: &Path, width: usize, height: usize, rgb: &[u8]) -> io::Result<()> {
    assert_eq!(rgb.len(), width * height * 3);

    let mut writer = BufWriter::new(File::create(path)?);
    write!(writer, "P6\n{width} {height}\n255\n")?;
    writer.write_all(rgb)?;
    writer.flush()
}

#[cfg(test)]
mod test_ppm {
    use super::*;

    #[test]
    fn test_header_and_payload() {
        let path = std::env::temp_dir().join("tinyrt_test_image.ppm");
        let pixels = [255u8, 0, 0, 0, 255, 0, 0, 0, 255, 10, 20, 30];
        write_ppm(&path, 2, 2, &pixels).unwrap();

        let bytes = std::fs::read(&path).unwrap();
        assert!(bytes.starts_with(b"P6\n2 2\n255\n"));
        assert_eq!(&bytes[b"P6\n2 2\n255\n".len()..], &pixels);

        std::fs::remove_file(&path).ok();
    }
}
