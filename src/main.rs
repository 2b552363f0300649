//! Structure dumper: prints a file's hierarchy, and optionally the values
//! of one dataset.
//!
//! Usage: h5lite <file> [dataset-path] [--debug]

use h5lite::{ChildKind, DecodedValue};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut args: Vec<String> = std::env::args().skip(1).collect();
    if let Some(i) = args.iter().position(|a| a == "--debug") {
        args.remove(i);
        h5lite::set_debug(true);
    }
    let filename = match args.first() {
        Some(f) => f.clone(),
        None => {
            eprintln!("usage: h5lite <file> [dataset-path] [--debug]");
            std::process::exit(2);
        }
    };

    let file = h5lite::open(&filename)?;
    let summary = file.inspect()?;
    println!(
        "{}: superblock v{}, base offset {}, {} group(s), {} dataset(s), depth {}",
        filename,
        summary.superblock_version,
        file.base_offset(),
        summary.group_count,
        summary.dataset_count,
        summary.max_depth,
    );
    if summary.chunked_count > 0 || summary.compressed_count > 0 {
        println!(
            "  {} chunked, {} compressed",
            summary.chunked_count, summary.compressed_count
        );
    }

    for (path, info) in file.list_recursive()? {
        match info.kind {
            ChildKind::Group => println!("  {}/", path),
            ChildKind::Dataset => println!(
                "  {}  {}  {:?}",
                path,
                info.dtype.as_deref().unwrap_or("?"),
                info.shape.as_deref().unwrap_or(&[]),
            ),
        }
    }

    if let Some(dataset_path) = args.get(1) {
        let dataset = file.open_dataset(dataset_path)?;
        for name in dataset.attributes() {
            println!("{}@{} = {:?}", dataset_path, name, dataset.read_attribute(&name)?);
        }
        match dataset.read()? {
            DecodedValue::Scalar(v) => println!("{:?}", v),
            DecodedValue::OneD(v) => println!("{:?}", v),
            DecodedValue::TwoD { rows, cols, data } => {
                println!("{} x {}: {:?}", rows, cols, data)
            }
            DecodedValue::NDim { shape, data } => println!("{:?}: {:?}", shape, data),
        }
    }

    Ok(())
}
