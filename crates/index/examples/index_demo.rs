use index::{HnswIndex, IndexConfig, SimilarityMetric, VectorIndex};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = IndexConfig::new(4).with_metric(SimilarityMetric::Cosine);
    let index = HnswIndex::new(config)?;

    // Seed a few subject profile vectors.
    let profiles = [
        ("subj-alfa", [1.0, 0.0, 0.0, 0.0]),
        ("subj-bravo", [0.9, 0.1, 0.0, 0.0]),
        ("subj-carani", [0.0, 1.0, 0.0, 0.0]),
    ];
    for (subject_id, vector) in &profiles {
        index.upsert(subject_id, vector).await?;
    }
    println!("Indexed {} subjects.", index.len().await?);

    // Re-inserting a subject replaces its vector instead of adding a
    // second entry.
    index.upsert("subj-bravo", &[0.8, 0.2, 0.0, 0.0]).await?;
    println!("Still {} after an upsert.", index.len().await?);

    let hits = index.query(&[1.0, 0.0, 0.0, 0.0], 2).await?;
    for hit in &hits {
        println!("{}: similarity {:.3}", hit.subject_id, hit.similarity);
    }

    Ok(())
}
