use overlay_sync::{
    Annotation, ContentId, ElementRef, HostDocument, HostElement, MemoryDocument, StateRegistry,
};

pub const ANNOTATION_MARKER: &str = "data-overlay-annotation";
pub const AUXILIARY_MARKER: &str = "data-overlay-anchor";
pub const TILE_CLASS: &str = "title-card";
pub const CONTENT_ID_ATTR: &str = "data-content-id";

/// Appends a row of `count` content tiles to the body, numbering their
/// content ids from `first_id`.
pub fn populate_row(document: &MemoryDocument, first_id: u64, count: usize) -> Vec<ElementRef> {
    let body = document.body();
    let row = document
        .create_child(&body, "div", &["lolomo-row"])
        .expect("row appended");
    let tiles: Vec<ElementRef> = (0..count as u64)
        .map(|offset| {
            let tile = document.create_element("div");
            tile.set_attribute("class", TILE_CLASS).expect("class set");
            tile.set_attribute(CONTENT_ID_ATTR, &(first_id + offset).to_string())
                .expect("id set");
            tile
        })
        .collect();
    document
        .append_children(&row, &tiles)
        .expect("tiles appended");
    tiles
}

/// Every connected content tile in the document.
pub fn tiles(document: &MemoryDocument) -> Vec<ElementRef> {
    document
        .query_attribute(CONTENT_ID_ATTR)
        .into_iter()
        .filter(|tile| tile.has_class(TILE_CLASS))
        .collect()
}

/// Renders a badge inside `tile` and tracks it under the current generation.
pub fn annotate(document: &MemoryDocument, registry: &StateRegistry, tile: &ElementRef) -> ElementRef {
    let id = ContentId::new(
        tile.attribute(CONTENT_ID_ATTR)
            .expect("tile carries a content id"),
    );
    let badge = document.create_element("span");
    badge
        .set_attribute(ANNOTATION_MARKER, id.as_str())
        .expect("marker set");
    document.append_child(tile, &badge).expect("badge appended");
    tile.set_attribute(AUXILIARY_MARKER, "top-right")
        .expect("anchor marker set");

    registry.set_annotation(
        id.clone(),
        Annotation::new(id, registry.current_generation(), badge.clone(), tile),
    );
    badge
}

pub fn annotate_all(document: &MemoryDocument, registry: &StateRegistry) -> usize {
    let tiles = tiles(document);
    for tile in &tiles {
        annotate(document, registry, tile);
    }
    tiles.len()
}

/// Adds a marked element the registry knows nothing about.
pub fn add_stray(document: &MemoryDocument) -> ElementRef {
    let body = document.body();
    let stray = document.create_element("span");
    stray
        .set_attribute(ANNOTATION_MARKER, "orphan")
        .expect("marker set");
    document.append_child(&body, &stray).expect("stray appended");
    stray
}
