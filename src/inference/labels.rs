use std::{
    fs::File,
    io::{self, BufRead},
    path::Path,
};

pub fn load_labels(filepath: &Path) -> io::Result<Vec<String>> {
    let file = File::open(filepath)?;
    parse_labels(io::BufReader::new(file))
}

/// One class per line. The `label,red,green,blue` form used by colour-coded label files
/// is accepted too; only the name is kept.
pub fn parse_labels<R: BufRead>(reader: R) -> io::Result<Vec<String>> {
    let mut labels = Vec::new();

    for line_result in reader.lines() {
        let line = line_result?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let parts: Vec<&str> = line.split(',').collect();
        match parts.len() {
            1 | 4 => labels.push(parts[0].trim().to_string()),
            _ => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("Invalid line format: {}", line),
                ))
            }
        }
    }

    if labels.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "Labels file contains no classes",
        ));
    }

    Ok(labels)
}
